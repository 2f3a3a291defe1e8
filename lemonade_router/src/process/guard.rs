//! Process guard
//! =============
//!
//! Launches and supervises a single inference-server subprocess,
//! guaranteeing clean-up across Linux/BSD, macOS and Windows.
//!
//! Responsibilities:
//! * **Spawn** the server with stdout/stderr piped; two pump threads feed
//!   each line to a caller-provided sink (this is where telemetry parsing
//!   hooks in).
//! * **Persist** a pidfile so a second supervisor cannot claim the slot and
//!   so `stop` can find the child after a crash of the owner.
//! * **Contain** the whole child tree using the best mechanism per platform.
//! * **Clean up** (`SIGTERM`/`TerminateProcess` → grace → force kill) on
//!   [`BackendProcessGuard::stop`] or on `Drop`.
//!
//! | OS | Containment | Notes |
//! |----|-------------|-------|
//! | Linux/BSD | process-group + `prctl(PDEATHSIG)` | kernel kills on parent death |
//! | macOS | anonymous lifeline pipe | child may outlive a crashed parent |
//! | Windows | Job object, kill-on-close | closing the handle nukes the tree |

use std::{
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{Mutex, RwLock},
    time::Duration,
};

use wait_timeout::ChildExt;

use super::{error::*, kill::*, pid::*, FORCE_KILL_TIMEOUT_SECS};

/// Receives one line of child output at a time.
pub type LineSink = Box<dyn FnMut(&str) + Send + 'static>;

/// RAII handle owning a running backend process.
///
/// While the guard is alive the child is supervised and the on-disk pidfile
/// blocks competing launches. Dropping the guard (or calling `stop`) kills
/// the whole process tree and removes the pidfile.
#[derive(Debug)]
pub struct BackendProcessGuard {
    /// Handle to the child; `None` once reaped.
    child: RwLock<Option<Child>>,
    /// PID at spawn time; stable even after the child handle is consumed.
    pid: u32,
    pidfile: PathBuf,
    /// stdout/stderr pump threads; joined after the child dies.
    pumps: Mutex<Vec<std::thread::JoinHandle<()>>>,
    /// Windows-only: RAII wrapper around the Job object.
    _job: attach::JobGuard,
    /// macOS-only: write end of the lifeline pipe.
    _life: attach::Lifeline,
}

impl BackendProcessGuard {
    /// Spawn `cmd` under supervision. The command's stdout/stderr are piped
    /// and forwarded line-by-line to the given sinks.
    pub fn spawn(
        mut cmd: Command,
        pidfile_path: &Path,
        stdout_sink: LineSink,
        stderr_sink: LineSink,
    ) -> Result<Self> {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut pidfile_handle = create_pidfile(pidfile_path)?;

        crate::info!("spawning backend: {cmd:?}");
        let attached = match attach::attach(cmd) {
            Ok(a) => a,
            Err(e) => {
                // launch failed: remove the pidfile we just claimed
                let _ = std::fs::remove_file(pidfile_path);
                return Err(e);
            }
        };

        let mut child = attached.child;
        let pid = child.id();

        let mut pumps = Vec::with_capacity(2);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let pump_result: Result<()> = (|| {
            if let Some(stdout) = stdout {
                pumps.push(Self::pump(stdout, stdout_sink, "stdout")?);
            }
            if let Some(stderr) = stderr {
                pumps.push(Self::pump(stderr, stderr_sink, "stderr")?);
            }
            Ok(())
        })();
        if let Err(e) = pump_result {
            let _ = kill_pid(pid);
            let _ = std::fs::remove_file(pidfile_path);
            return Err(e);
        }

        if let Err(e) = writeln!(&mut pidfile_handle, "{pid}") {
            let _ = kill_pid(pid);
            let _ = std::fs::remove_file(pidfile_path);
            return Err(ProcessError::CommandFailed {
                action: "write pidfile",
                source: e.into(),
            });
        }

        Ok(Self {
            child: RwLock::new(Some(child)),
            pid,
            pidfile: pidfile_path.to_path_buf(),
            pumps: Mutex::new(pumps),
            _job: attached.job,
            _life: attached.life,
        })
    }

    fn pump<R: std::io::Read + Send + 'static>(
        stream: R,
        mut sink: LineSink,
        label: &'static str,
    ) -> Result<std::thread::JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("backend-{label}-pump"))
            .spawn(move || {
                let reader = BufReader::new(stream);
                for line in reader.lines() {
                    match line {
                        Ok(line) => sink(&line),
                        Err(_) => break,
                    }
                }
            })
            .map_err(|e| ProcessError::CommandFailed {
                action: "spawn output pump thread",
                source: e.into(),
            })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Liveness from the child handle itself; `try_wait` also reaps, so a
    /// zombie never reads as alive here.
    pub fn is_alive(&self) -> bool {
        let mut guard = self.child.write().expect("child lock poisoned");
        match guard.as_mut() {
            None => false,
            Some(child) => match child.try_wait() {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(_) => pid_alive(self.pid).unwrap_or(false),
            },
        }
    }

    /// Best-effort, idempotent shutdown:
    /// 1. polite signal, 2. wait up to `grace`, 3. force kill,
    /// 4. remove the pidfile (ignoring permission errors), 5. join pumps.
    pub fn stop(&self, grace: Duration) -> Result<()> {
        let result = self.kill_child(grace);

        match std::fs::remove_file(&self.pidfile) {
            Ok(()) => (),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
            Err(e) => crate::error!("failed to remove pidfile {:?}: {e}", self.pidfile),
        }

        // The pipes are closed once the child is gone, so the pumps drain
        // and exit on their own.
        let mut pumps = self.pumps.lock().expect("pump lock poisoned");
        for handle in pumps.drain(..) {
            let _ = handle.join();
        }

        result
    }

    fn kill_child(&self, grace: Duration) -> Result<()> {
        let Some(mut child) = self.child.write().expect("child lock poisoned").take() else {
            return Ok(());
        };

        if child
            .try_wait()
            .map_err(|e| ProcessError::CommandFailed {
                action: "get exit status",
                source: e.into(),
            })?
            .is_some()
        {
            return Ok(());
        }

        if let Err(e) = kill_tree_polite(child.id()) {
            crate::error!("failed to send TERM to PID {}: {e}", child.id());
        }

        if let Some(status) =
            child
                .wait_timeout(grace)
                .map_err(|e| ProcessError::CommandFailed {
                    action: "polite wait for exit",
                    source: e.into(),
                })?
        {
            crate::info!("backend exited gracefully with status {status}");
            return Ok(());
        }

        if let Err(e) = kill_tree_force(child.id()) {
            crate::error!("failed to force-kill group of PID {}: {e}", child.id());
        }
        child.kill().map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => ProcessError::PermissionDenied {
                action: "force-kill",
                source: e.into(),
            },
            _ => ProcessError::CommandFailed {
                action: "force-kill",
                source: e.into(),
            },
        })?;

        match child
            .wait_timeout(Duration::from_secs(FORCE_KILL_TIMEOUT_SECS))
            .map_err(|e| ProcessError::CommandFailed {
                action: "wait after force-kill",
                source: e.into(),
            })? {
            Some(status) => {
                crate::info!("backend force-killed; exit status {status}");
                Ok(())
            }
            None => Err(ProcessError::TerminationTimeout {
                operation: "force-kill",
                elapsed: Duration::from_secs(FORCE_KILL_TIMEOUT_SECS),
                leftovers: vec![child.id()],
            }),
        }
    }
}

impl Drop for BackendProcessGuard {
    fn drop(&mut self) {
        if let Err(e) = self.stop(super::DEFAULT_GRACE) {
            crate::error!("failed to stop backend process on drop: {e}");
        }
    }
}

/// Result of platform attachment: the spawned child plus whatever RAII
/// token keeps the containment alive.
struct Attached {
    child: Child,
    job: attach::JobGuard,
    life: attach::Lifeline,
}

// Linux / other Unix ─────────────────────────────────────────
#[cfg(all(unix, not(target_os = "macos")))]
mod attach {
    use std::os::unix::process::CommandExt;

    use nix::{
        sys::{prctl::set_pdeathsig, signal::Signal},
        unistd::{Pid, setpgid},
    };

    use super::*;

    pub type JobGuard = ();
    pub type Lifeline = ();

    pub fn attach(mut cmd: Command) -> Result<Attached> {
        // Child becomes leader of its own process group *and* gets SIGTERM
        // from the kernel if this process dies without running handlers.
        unsafe {
            cmd.pre_exec(|| {
                setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                set_pdeathsig(Some(Signal::SIGTERM))?;
                Ok(())
            })
        };
        let program = cmd.get_program().to_string_lossy().into_owned();
        let child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
            program,
            source: e.into(),
        })?;
        Ok(Attached {
            child,
            job: (),
            life: (),
        })
    }
}

// macOS ──────────────────────────────────────────────────────
#[cfg(target_os = "macos")]
mod attach {
    use std::os::{
        fd::{AsFd, AsRawFd},
        unix::io::OwnedFd,
    };

    use nix::{
        fcntl::{FcntlArg, FdFlag, fcntl},
        unistd::pipe,
    };

    use super::*;

    /// Write end of the lifeline pipe; the child sees EOF when we die.
    #[derive(Debug)]
    #[allow(dead_code)]
    pub struct Lifeline(pub Option<OwnedFd>);

    pub type JobGuard = ();

    pub fn attach(mut cmd: Command) -> Result<Attached> {
        let (r, w) = pipe().map_err(|e| ProcessError::CommandFailed {
            action: "create lifeline pipe",
            source: e.into(),
        })?;

        // Read end is inherited by the child; write end stays here.
        fcntl(r.as_fd(), FcntlArg::F_SETFD(FdFlag::empty())).map_err(|e| {
            ProcessError::CommandFailed {
                action: "set lifeline read end flags",
                source: e.into(),
            }
        })?;
        fcntl(w.as_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(|e| {
            ProcessError::CommandFailed {
                action: "set lifeline write end flags",
                source: e.into(),
            }
        })?;

        cmd.env("LEMONADE_LIFELINE_FD", r.as_raw_fd().to_string());

        let program = cmd.get_program().to_string_lossy().into_owned();
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                drop(r);
                drop(w);
                return Err(ProcessError::SpawnFailed {
                    program,
                    source: Box::new(e),
                });
            }
        };
        drop(r);

        Ok(Attached {
            child,
            job: (),
            life: Lifeline(Some(w)),
        })
    }
}

// Windows ────────────────────────────────────────────────────
#[cfg(windows)]
mod attach {
    use std::os::windows::{io::AsRawHandle, process::CommandExt};

    use windows::Win32::{
        Foundation::{CloseHandle, HANDLE},
        System::{JobObjects::*, Threading::CREATE_NEW_PROCESS_GROUP},
    };

    use super::*;

    #[derive(Debug)]
    pub struct JobGuard(pub Option<HANDLE>);

    impl Drop for JobGuard {
        fn drop(&mut self) {
            if let Some(h) = self.0.take() {
                unsafe {
                    if CloseHandle(h).is_err() {
                        let err = std::io::Error::last_os_error();
                        crate::error!("failed to close Job handle {h:?}: {err}");
                    }
                }
            }
        }
    }

    pub type Lifeline = ();

    pub fn attach(mut cmd: Command) -> Result<Attached> {
        let hjob = unsafe {
            CreateJobObjectW(None, None).map_err(|e| ProcessError::CommandFailed {
                action: "CreateJobObjectW",
                source: Box::new(e),
            })?
        };
        let mut job_guard = JobGuard(Some(hjob));

        // Closing the (last) job handle terminates every process assigned
        // to it, so even an abnormal parent exit reaps the tree.
        let mut info = JOBOBJECT_EXTENDED_LIMIT_INFORMATION::default();
        info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;

        unsafe {
            SetInformationJobObject(
                hjob,
                JobObjectExtendedLimitInformation,
                &info as *const _ as _,
                std::mem::size_of_val(&info) as _,
            )
            .map_err(|e| ProcessError::CommandFailed {
                action: "SetInformationJobObject",
                source: Box::new(e),
            })?;
        }

        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP.0);
        let program = cmd.get_program().to_string_lossy().into_owned();
        let child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
            program,
            source: Box::new(e),
        })?;

        if let Err(e) = unsafe { AssignProcessToJobObject(hjob, HANDLE(child.as_raw_handle())) } {
            drop(job_guard);
            return Err(ProcessError::CommandFailed {
                action: "AssignProcessToJobObject",
                source: Box::new(e),
            });
        }

        let hjob = job_guard.0.take();
        Ok(Attached {
            child,
            job: JobGuard(hjob),
            life: (),
        })
    }
}
