//! Single-instance guarantee
//! =========================
//!
//! At most one persistent `serve` process per user: an exclusive advisory
//! file lock under the cache root, held for the lifetime of the process.
//! Alongside the lock, a small discovery file (`lemonade-router.pid`,
//! `<pid>\n<port>`) lets `status`/`stop` from other processes find the
//! running server without talking to the lock.

use std::{io::ErrorKind, path::PathBuf};

use fs4::fs_std::FileExt;
use lemonade_models::HubCache;

use crate::{
    error::{RouterError, RouterResult},
    process::pid_alive,
};

pub const INSTANCE_TAG: &str = "lemonade-router";

/// Holds the exclusive lock while alive; releases it (and removes the
/// discovery file) on drop.
#[derive(Debug)]
pub struct InstanceLock {
    /// The advisory lock lives on this handle; closing it releases.
    _file: std::fs::File,
    discovery_path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(cache: &HubCache, port: u16) -> RouterResult<Self> {
        std::fs::create_dir_all(cache.root())
            .map_err(|e| RouterError::file_system("create cache directory", cache.root(), e))?;

        let lock_path = cache.lock_path(INSTANCE_TAG);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&lock_path)
            .map_err(|e| RouterError::file_system("open instance lock", &lock_path, e))?;

        file.try_lock_exclusive().map_err(|e| match e.kind() {
            ErrorKind::WouldBlock => RouterError::AlreadyRunning {
                pid: Self::discover(cache).map(|(pid, _)| pid).unwrap_or(0),
            },
            _ => RouterError::file_system("acquire instance lock", &lock_path, e),
        })?;

        let discovery_path = cache.pid_file_path();
        std::fs::write(
            &discovery_path,
            format!("{}\n{port}\n", std::process::id()),
        )
        .map_err(|e| RouterError::file_system("write discovery file", &discovery_path, e))?;

        crate::info!(
            "instance lock acquired (PID {}, port {port})",
            std::process::id()
        );
        Ok(Self {
            _file: file,
            discovery_path,
        })
    }

    /// `(pid, port)` of a *live* running server, from the discovery file.
    /// A stale file (dead PID) is cleaned up and reads as "not running".
    pub fn discover(cache: &HubCache) -> Option<(u32, u16)> {
        let path = cache.pid_file_path();
        let raw = std::fs::read_to_string(&path).ok()?;
        let mut lines = raw.lines();
        let pid: u32 = lines.next()?.trim().parse().ok()?;
        let port: u16 = lines.next()?.trim().parse().ok()?;

        if pid_alive(pid).unwrap_or(false) {
            Some((pid, port))
        } else {
            let _ = std::fs::remove_file(&path);
            None
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.discovery_path) {
            if e.kind() != ErrorKind::NotFound {
                crate::warn!("failed to remove discovery file: {e}");
            }
        }
        // the advisory lock releases when `_file` closes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_first_released() {
        let td = tempfile::tempdir().unwrap();
        let cache = HubCache::new(td.path().to_path_buf());

        let first = InstanceLock::acquire(&cache, 8000).unwrap();
        assert!(matches!(
            InstanceLock::acquire(&cache, 8001),
            Err(RouterError::AlreadyRunning { .. })
        ));

        // discovery points at us
        let (pid, port) = InstanceLock::discover(&cache).unwrap();
        assert_eq!(pid, std::process::id());
        assert_eq!(port, 8000);

        drop(first);
        assert!(
            InstanceLock::discover(&cache).is_none(),
            "discovery file removed on release"
        );
        let _third = InstanceLock::acquire(&cache, 8002).unwrap();
    }

    #[test]
    fn stale_discovery_file_reads_as_not_running() {
        let td = tempfile::tempdir().unwrap();
        let cache = HubCache::new(td.path().to_path_buf());
        std::fs::create_dir_all(cache.root()).unwrap();

        // A PID that cannot be alive.
        std::fs::write(cache.pid_file_path(), "999999\n8000\n").unwrap();
        assert!(InstanceLock::discover(&cache).is_none());
        assert!(!cache.pid_file_path().exists(), "stale file cleaned up");
    }
}
