//! Host-wide exclusion for lifecycle operations
//!
//! Every clashd process working on the same application config (the daemon
//! and one-shot CLI invocations alike) takes an exclusive `flock(2)` on a
//! lock file next to that config before starting or stopping the core.

use crate::error::{Result, ServiceError};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Held lock; released when dropped
#[derive(Debug)]
pub struct LifecycleLock {
    _file: File,
    path: PathBuf,
}

impl LifecycleLock {
    /// Lock file belonging to an application config, `app.toml` -> `app.toml.lock`
    pub fn path_for(config_path: &Path) -> PathBuf {
        let mut name = config_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "clashd".into());
        name.push(".lock");
        config_path.with_file_name(name)
    }

    /// Take the lock without waiting. `Ok(None)` means another holder has it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let lock_err = |source| ServiceError::Lock {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(lock_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(lock_err)?;

        // SAFETY: flock(2) on a descriptor owned by `file` for its whole lifetime
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                debug!("{:?} is held by another operation", path);
                return Ok(None);
            }
            return Err(lock_err(err));
        }

        Ok(Some(Self {
            _file: file,
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_path_for() {
        assert_eq!(
            LifecycleLock::path_for(Path::new("/etc/clashd/app.toml")),
            PathBuf::from("/etc/clashd/app.toml.lock")
        );
    }

    #[test]
    fn test_exclusive_until_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run/app.toml.lock");

        let held = LifecycleLock::try_acquire(&path).unwrap().unwrap();
        assert_eq!(held.path(), path);
        // a second open file description conflicts even within one process
        assert!(LifecycleLock::try_acquire(&path).unwrap().is_none());

        drop(held);
        assert!(LifecycleLock::try_acquire(&path).unwrap().is_some());
    }
}
