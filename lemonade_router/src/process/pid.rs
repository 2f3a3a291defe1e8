//! PID-file management and process discovery
//! =========================================
//!
//! Small synchronous helpers shared by the supervisor and the CLI:
//!
//! * pidfile create/read (exclusive create so two supervisors cannot claim
//!   the same backend slot),
//! * process scans by executable name or argv pattern (used when a pidfile
//!   is stale or missing),
//! * a cross-platform liveness probe that counts Linux zombies as dead.

use std::{
    ffi::OsString,
    fs::OpenOptions,
    path::Path,
};

use sysinfo::{ProcessRefreshKind, RefreshKind, UpdateKind};

use super::error::*;

pub fn create_pidfile(pidfile_path: &Path) -> Result<std::fs::File> {
    if pidfile_path.exists() {
        return Err(ProcessError::CommandFailed {
            action: "check pidfile existence",
            source: format!("pidfile {pidfile_path:?} already exists").into(),
        });
    }

    let parent = pidfile_path
        .parent()
        .ok_or_else(|| ProcessError::CommandFailed {
            action: "determine pidfile parent directory",
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "pidfile has no parent directory",
            )
            .into(),
        })?;
    if !parent.exists() {
        std::fs::create_dir_all(parent).map_err(|e| ProcessError::CommandFailed {
            action: "create pidfile parent directory",
            source: e.into(),
        })?;
    }

    let mut options = OpenOptions::new();

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o644);
    }

    options
        .write(true)
        .create_new(true)
        .open(pidfile_path)
        .map_err(|e| ProcessError::CommandFailed {
            action: "create pidfile",
            source: e.into(),
        })
}

pub fn pid_from_pidfile(pidfile_path: &Path) -> Result<u32> {
    let content =
        std::fs::read_to_string(pidfile_path).map_err(|e| ProcessError::CommandFailed {
            action: "read pidfile",
            source: e.into(),
        })?;
    content
        .trim()
        .parse::<u32>()
        .map_err(|e| ProcessError::CommandFailed {
            action: "parse pid from pidfile",
            source: e.into(),
        })
}

/// All PIDs whose executable name matches (kernel truncation aware on Linux).
pub fn pids_by_executable_name(executable_name: &str) -> Vec<u32> {
    let sys = sysinfo::System::new_with_specifics(
        RefreshKind::nothing()
            .with_processes(ProcessRefreshKind::nothing().with_exe(UpdateKind::Always)),
    );

    let want = &executable_name.as_bytes()[..15.min(executable_name.len())];

    sys.processes()
        .values()
        .filter_map(|p| {
            #[cfg(target_os = "linux")]
            {
                use std::os::unix::ffi::OsStrExt;
                if p.name().as_bytes() == want {
                    return Some(p.pid().as_u32());
                }
            }
            #[cfg(any(windows, target_os = "macos"))]
            if p.name().as_encoded_bytes() == want {
                return Some(p.pid().as_u32());
            }

            #[allow(unreachable_code)]
            None
        })
        .collect()
}

/// First PID whose argv contains one of the given token sequences, in order.
/// Tokens split on whitespace and `=` so `--port 8000` matches
/// `--port=8000` too.
pub fn pid_by_argv(patterns: &[&[&str]]) -> Option<u32> {
    fn argv_contains_sequence(cmd: &[OsString], seq: &[&str]) -> bool {
        let flat: Vec<String> = cmd
            .iter()
            .flat_map(|arg| {
                arg.to_string_lossy()
                    .split_whitespace()
                    .flat_map(|tok| match tok.split_once('=') {
                        Some((flag, val)) => vec![flag.to_owned(), val.to_owned()],
                        None => vec![tok.to_owned()],
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        flat.windows(seq.len())
            .any(|w| seq.iter().zip(w).all(|(pat, tok)| pat == tok))
    }

    let sys = sysinfo::System::new_with_specifics(
        RefreshKind::nothing().with_processes(
            ProcessRefreshKind::nothing()
                .with_cmd(UpdateKind::Always)
                .with_exe(UpdateKind::Always),
        ),
    );

    for p in sys.processes().values() {
        if patterns
            .iter()
            .any(|pat| argv_contains_sequence(p.cmd(), pat))
        {
            return Some(p.pid().as_u32());
        }
    }

    None
}

/// Is the PID alive? A Linux zombie is *dead* for our purposes: it will
/// never serve another request, it just has not been reaped yet.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> Result<bool> {
    use nix::{errno::Errno, sys::signal::kill, unistd::Pid};

    match kill(Pid::from_raw(pid as i32), None) {
        Err(Errno::ESRCH) => return Ok(false),
        Err(Errno::EPERM) => {
            return Err(ProcessError::PermissionDenied {
                action: "probe process (signal 0)",
                source: "operation not permitted".into(),
            });
        }
        Err(e) => {
            return Err(ProcessError::CommandFailed {
                action: "probe process (signal 0)",
                source: e.into(),
            });
        }
        Ok(_) => (),
    }

    #[cfg(target_os = "linux")]
    {
        // /proc/<pid>/stat: "pid (comm) S ..." – the state field follows the
        // *last* ')' because comm may itself contain parentheses.
        if let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            let state = stat
                .rsplit_once(')')
                .map(|(_, rest)| rest.trim_start())
                .and_then(|rest| rest.chars().next());
            if state == Some('Z') {
                return Ok(false);
            }
        }
    }

    Ok(true)
}

#[cfg(windows)]
pub fn pid_alive(pid: u32) -> Result<bool> {
    use windows::{
        Win32::{
            Foundation::{CloseHandle, ERROR_ACCESS_DENIED, ERROR_INVALID_PARAMETER, WAIT_TIMEOUT},
            System::Threading::{
                OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_SYNCHRONIZE,
                WaitForSingleObject,
            },
        },
        core::HRESULT,
    };

    unsafe {
        match OpenProcess(
            PROCESS_QUERY_LIMITED_INFORMATION | PROCESS_SYNCHRONIZE,
            false,
            pid,
        ) {
            Ok(handle) => {
                let status = WaitForSingleObject(handle, 0);
                let _ = CloseHandle(handle);
                Ok(status == WAIT_TIMEOUT)
            }
            Err(e) => match e.code() {
                hr if hr == HRESULT::from(ERROR_INVALID_PARAMETER) => Ok(false),
                hr if hr == HRESULT::from(ERROR_ACCESS_DENIED) => {
                    Err(ProcessError::PermissionDenied {
                        action: "probe process (OpenProcess)",
                        source: Box::new(e),
                    })
                }
                _ => Err(ProcessError::CommandFailed {
                    action: "probe process (OpenProcess)",
                    source: Box::new(e),
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;
    use crate::process::tests_helpers::*;

    #[test]
    fn pid_alive_states() -> Result<()> {
        let mut child = short_cmd().spawn().unwrap();
        let pid = child.id();
        assert!(pid_alive(pid)?);
        let _ = child.kill();
        let _ = child.wait();
        assert!(!pid_alive(pid)?);

        // A zombie (exited but unreaped) counts as dead.
        #[cfg(target_os = "linux")]
        {
            let ch = std::process::Command::new("sh")
                .args(["-c", "exit 0"])
                .spawn()
                .unwrap();
            let zpid = ch.id();
            // Keep the Child alive (no wait) so the kernel keeps the zombie.
            thread::sleep(Duration::from_millis(200));
            assert!(!pid_alive(zpid).unwrap());
            drop(ch);
        }
        Ok(())
    }

    #[test]
    fn pid_by_argv_matches_in_order() {
        #[cfg(unix)]
        let mut child = {
            let mut c = std::process::Command::new("sh");
            c.args(["-c", "sleep 5", "--", "--backend-port", "51515"]);
            c.spawn().unwrap()
        };
        #[cfg(windows)]
        let mut child = {
            let mut c = std::process::Command::new("cmd");
            c.args(["/C", "timeout /T 5 /NOBREAK &REM --backend-port 51515"]);
            c.spawn().unwrap()
        };
        let pid = child.id();
        thread::sleep(Duration::from_millis(200));

        assert_eq!(pid_by_argv(&[&["--backend-port", "51515"]]), Some(pid));
        assert_eq!(pid_by_argv(&[&["51515", "--backend-port"]]), None);
        assert_eq!(pid_by_argv(&[&["--backend-port", "99999"]]), None);

        let _ = child.kill();
        let _ = child.wait();
    }

    #[test]
    fn pidfile_create_read_and_refuse_existing() {
        let td = tempfile::tempdir().unwrap();
        let pf = td.path().join("backends").join("llamacpp_51515.pid");

        use std::io::Write;
        let mut handle = create_pidfile(&pf).unwrap();
        writeln!(handle, "4242").unwrap();
        assert_eq!(pid_from_pidfile(&pf).unwrap(), 4242);

        // Second create must refuse: the slot is taken.
        assert!(create_pidfile(&pf).is_err());

        std::fs::write(&pf, "not-a-pid").unwrap();
        assert!(pid_from_pidfile(&pf).is_err());
    }
}
