//! Termination ladder
//! ==================
//!
//! Cross-platform helpers for shutting down backend server processes:
//!
//! 1. **Polite** – `SIGTERM` / `TerminateProcess` against the recorded PID.
//! 2. **Wait** – poll liveness until the grace period elapses.
//! 3. **Force** – `SIGKILL` / `TerminateProcess`, then verify.
//!
//! Stubborn PIDs come back in [`ProcessError::TerminationTimeout`] so the
//! caller can log or escalate instead of silently leaking children.

use std::{
    path::Path,
    time::{Duration, Instant},
};

use super::{error::*, pid::*, FORCE_KILL_TIMEOUT_SECS, POLL_INTERVAL_MS};

/// Kill the backend recorded in `pidfile_path`, falling back to an argv scan
/// for `argv_pattern` when the file is stale or corrupt. Used by the CLI
/// `stop` path when the owning supervisor is gone.
pub fn kill_by_pidfile(pidfile_path: &Path, argv_pattern: &[&str]) -> Result<()> {
    let pid: Option<u32> = std::fs::read_to_string(pidfile_path)
        .ok()
        .and_then(|s| s.trim().parse().ok());

    if let Some(pid) = pid {
        match pid_alive(pid) {
            Ok(true) => {
                crate::info!("killing backend (PID {pid}) via pidfile");
                let res = kill_pids(&[pid], super::DEFAULT_GRACE);
                if res.is_ok() {
                    if let Err(e) = std::fs::remove_file(pidfile_path) {
                        crate::warn!("failed to remove pidfile {pidfile_path:?}: {e}");
                    }
                }
                return res;
            }
            Ok(false) => {
                // stale file: delete and fall through to the argv scan
                if let Err(e) = std::fs::remove_file(pidfile_path) {
                    crate::warn!("failed to remove stale pidfile {pidfile_path:?}: {e}");
                }
            }
            Err(e) => {
                crate::warn!("pid_alive({pid}) failed: {e}; falling back to argv scan");
            }
        }
    } else if pidfile_path.exists() {
        if let Err(e) = std::fs::remove_file(pidfile_path) {
            crate::warn!("failed to remove malformed pidfile {pidfile_path:?}: {e}");
        }
    }

    if let Some(pid) = pid_by_argv(&[argv_pattern]) {
        crate::info!("killing backend (PID {pid}) via argv scan");
        return kill_pids(&[pid], super::DEFAULT_GRACE);
    }

    Err(ProcessError::NoSuchProcess {
        query: format!("pidfile={pidfile_path:?}"),
    })
}

/// Run the full ladder against a set of PIDs.
pub fn kill_pids(pids: &[u32], polite_wait: Duration) -> Result<()> {
    let mut seen = std::collections::HashSet::with_capacity(pids.len());
    let uniq: Vec<u32> = pids.iter().copied().filter(|p| seen.insert(*p)).collect();
    if uniq.is_empty() {
        return Ok(());
    }
    let start = Instant::now();

    // phase 1 – polite signal
    for pid in &uniq {
        match pid_alive(*pid) {
            Ok(true) => match kill_pid(*pid) {
                Ok(()) => crate::info!("sent TERM to PID {pid}"),
                Err(e) => crate::error!("failed to send TERM to PID {pid}: {e}"),
            },
            Ok(false) => (),
            Err(e) => crate::error!("failed to check PID {pid}: {e}"),
        }
    }

    // phase 2 – grace period, bailing early when everything is gone
    let polite_deadline = Instant::now() + polite_wait;
    while Instant::now() < polite_deadline {
        let all_dead = uniq
            .iter()
            .all(|&pid| matches!(pid_alive(pid), Ok(false)));
        if all_dead {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
    }

    // phase 3 – force kill and verify
    for &pid in &uniq {
        if let Err(e) = force_kill_pid(pid) {
            crate::error!("failed to force-kill PID {pid}: {e}");
        }
    }

    let force_deadline = Instant::now() + Duration::from_secs(FORCE_KILL_TIMEOUT_SECS);
    while Instant::now() < force_deadline {
        if uniq
            .iter()
            .all(|&pid| matches!(pid_alive(pid), Ok(false) | Err(_)))
        {
            break;
        }
        std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
    }

    #[cfg(target_os = "macos")]
    for &pid in &uniq {
        use nix::sys::wait::{WaitPidFlag, waitpid};
        // Reap our own children; ignore errors and non-children.
        let _ = waitpid(
            nix::unistd::Pid::from_raw(pid as i32),
            Some(WaitPidFlag::WNOHANG),
        );
    }

    let leftovers: Vec<u32> = uniq
        .iter()
        .copied()
        .filter(|&pid| !matches!(pid_alive(pid), Ok(false)))
        .collect();

    if leftovers.is_empty() {
        Ok(())
    } else {
        Err(ProcessError::TerminationTimeout {
            operation: "kill_pids",
            elapsed: start.elapsed(),
            leftovers,
        })
    }
}

/// Polite TERM for a child *and its process group* (the guard makes every
/// child a group leader). Falls back to the single PID when the group
/// signal is refused.
#[cfg(unix)]
pub fn kill_tree_polite(pid: u32) -> Result<()> {
    use nix::{
        errno::Errno,
        sys::signal::{Signal, kill},
        unistd::Pid,
    };
    match kill(Pid::from_raw(-(pid as i32)), Signal::SIGTERM) {
        Ok(_) | Err(Errno::ESRCH) => Ok(()),
        Err(_) => kill_pid(pid),
    }
}

/// The Job object tears the tree down on Windows; signalling the child is
/// enough here.
#[cfg(windows)]
pub fn kill_tree_polite(pid: u32) -> Result<()> {
    kill_pid(pid)
}

#[cfg(unix)]
pub fn kill_tree_force(pid: u32) -> Result<()> {
    use nix::{
        errno::Errno,
        sys::signal::{Signal, kill},
        unistd::Pid,
    };
    match kill(Pid::from_raw(-(pid as i32)), Signal::SIGKILL) {
        Ok(_) | Err(Errno::ESRCH) => Ok(()),
        Err(_) => force_kill_pid(pid),
    }
}

#[cfg(windows)]
pub fn kill_tree_force(pid: u32) -> Result<()> {
    force_kill_pid(pid)
}

#[cfg(unix)]
pub fn kill_pid(pid: u32) -> Result<()> {
    use nix::{
        errno::Errno,
        sys::signal::{Signal, kill},
        unistd::Pid,
    };
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(_) | Err(Errno::ESRCH) => Ok(()),
        Err(Errno::EPERM) => Err(ProcessError::PermissionDenied {
            action: "send SIGTERM",
            source: "operation not permitted".into(),
        }),
        Err(e) => Err(ProcessError::CommandFailed {
            action: "send SIGTERM",
            source: e.into(),
        }),
    }
}

#[cfg(unix)]
pub fn force_kill_pid(pid: u32) -> Result<()> {
    use nix::{
        errno::Errno,
        sys::signal::{Signal, kill},
        unistd::Pid,
    };
    match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(_) | Err(Errno::ESRCH) => Ok(()),
        Err(Errno::EPERM) => Err(ProcessError::PermissionDenied {
            action: "send SIGKILL",
            source: "operation not permitted".into(),
        }),
        Err(e) => Err(ProcessError::CommandFailed {
            action: "send SIGKILL",
            source: e.into(),
        }),
    }
}

#[cfg(windows)]
pub fn kill_pid(pid: u32) -> Result<()> {
    use windows::Win32::{
        Foundation::CloseHandle,
        System::Threading::{OpenProcess, PROCESS_TERMINATE, TerminateProcess},
    };

    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, false, pid).map_err(|e| {
            ProcessError::CommandFailed {
                action: "OpenProcess",
                source: Box::new(e),
            }
        })?;
        if handle.is_invalid() {
            return Ok(());
        }

        let result = TerminateProcess(handle, 1);
        let _ = CloseHandle(handle);
        result.map_err(|e| ProcessError::CommandFailed {
            action: "TerminateProcess",
            source: Box::new(e),
        })
    }
}

#[cfg(windows)]
pub fn force_kill_pid(pid: u32) -> Result<()> {
    use windows::Win32::{
        Foundation::CloseHandle,
        System::Threading::{OpenProcess, PROCESS_TERMINATE, TerminateProcess},
    };

    unsafe {
        let handle = match OpenProcess(PROCESS_TERMINATE, false, pid) {
            Ok(h) => h,
            Err(e) => {
                // 87 = ERROR_INVALID_PARAMETER: the process is already gone
                return if e.code().0 & 0xFFFF == 87 {
                    Ok(())
                } else {
                    Err(ProcessError::CommandFailed {
                        action: "force-kill (OpenProcess)",
                        source: Box::new(e),
                    })
                };
            }
        };
        match TerminateProcess(handle, 1) {
            Ok(_) => CloseHandle(handle).map_err(|e| ProcessError::CommandFailed {
                action: "force-kill (CloseHandle)",
                source: Box::new(e),
            }),
            Err(e) => {
                let _ = CloseHandle(handle);
                Err(ProcessError::CommandFailed {
                    action: "force-kill (TerminateProcess)",
                    source: Box::new(e),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;
    use tempfile::tempdir;

    use super::*;
    use crate::process::tests_helpers::*;

    #[test]
    #[serial]
    fn kill_pids_scenarios() {
        use ProcessError::*;

        // empty slice is always Ok
        assert!(kill_pids(&[], Duration::from_millis(10)).is_ok());

        // already-dead PID
        let dead_pid = {
            let mut child = short_cmd().spawn().unwrap();
            let pid = child.id();
            let _ = child.wait();
            pid
        };
        match kill_pids(&[dead_pid], Duration::from_millis(200)) {
            Ok(()) | Err(TerminationTimeout { .. }) => {}
            Err(e) => panic!("unexpected error on dead PID: {e:?}"),
        }

        // live child, duplicate entries, polite vs zero grace
        for (grace, duplicate) in [
            (Duration::from_secs(2), true),
            (Duration::from_secs(2), false),
            (Duration::from_secs(0), false),
        ] {
            let mut child = long_cmd().spawn().unwrap();
            let pid = child.id();
            let pids = if duplicate { vec![pid, pid] } else { vec![pid] };

            match kill_pids(&pids, grace) {
                Ok(()) | Err(TerminationTimeout { .. }) => {}
                Err(e) => panic!("kill_pids failed unexpectedly: {e:?}"),
            }
            let _ = child.wait();
            assert!(
                !pid_alive(pid).unwrap_or(true),
                "child {pid} survived kill_pids(grace={grace:?}, dup={duplicate})"
            );
        }
    }

    #[test]
    #[serial]
    fn kill_by_pidfile_happy_and_stale_paths() {
        let td = tempdir().unwrap();

        // happy path: live PID recorded in the file
        {
            let mut child = long_cmd().spawn().unwrap();
            let pf = td.path().join("live.pid");
            std::fs::write(&pf, child.id().to_string()).unwrap();

            kill_by_pidfile(&pf, &["--no-such-flag", "x"]).unwrap();
            assert!(!pf.exists(), "pidfile should be removed after kill");
            let _ = child.wait();
        }

        // stale pidfile, no matching process anywhere
        {
            let pf = td.path().join("stale.pid");
            std::fs::write(&pf, "999999").unwrap();
            let err = kill_by_pidfile(&pf, &["--no-such-flag", "x"]).unwrap_err();
            assert!(matches!(err, ProcessError::NoSuchProcess { .. }));
            assert!(!pf.exists(), "stale pidfile should be cleaned up");
        }

        // corrupt pidfile
        {
            let pf = td.path().join("corrupt.pid");
            std::fs::write(&pf, "not-a-number").unwrap();
            let err = kill_by_pidfile(&pf, &["--no-such-flag", "x"]).unwrap_err();
            assert!(matches!(err, ProcessError::NoSuchProcess { .. }));
            assert!(!pf.exists());
        }
    }
}
