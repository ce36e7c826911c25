//! PID file bookkeeping and signal-based liveness checks

use crate::error::{Result, ServiceError};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// `<working_dir>/mihomo.pid`, holding the decimal PID
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PID recorded in the file; `None` when absent or unreadable
    pub fn read(&self) -> Option<u32> {
        let contents = fs::read_to_string(&self.path).ok()?;
        contents.trim().parse::<u32>().ok().filter(|pid| *pid > 0)
    }

    pub fn write(&self, pid: u32) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.error(e))?;
        }
        fs::write(&self.path, pid.to_string()).map_err(|e| self.error(e))
    }

    /// Remove the file; a missing file is fine
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.error(e)),
        }
    }

    /// Live PID from the file. A file naming a dead or unparsable PID is
    /// stale and deleted on the spot.
    pub fn live_pid(&self) -> Option<u32> {
        let pid = match self.read() {
            Some(pid) => pid,
            None => {
                if self.path.exists() {
                    debug!("Removing unreadable PID file {:?}", self.path);
                    let _ = self.remove();
                }
                return None;
            }
        };

        if is_alive(pid) {
            Some(pid)
        } else {
            debug!("Removing stale PID file {:?} (pid {})", self.path, pid);
            let _ = self.remove();
            None
        }
    }

    fn error(&self, source: io::Error) -> ServiceError {
        ServiceError::PidFile {
            path: self.path.clone(),
            source,
        }
    }
}

/// Signal 0 check. EPERM means the process exists but belongs to someone else.
pub fn is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: kill(2) with signal 0 only checks for existence and permission
    let rc = unsafe { libc::kill(pid, 0) };
    let exists = rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    exists && !is_zombie(pid)
}

/// An exited process its parent has not collected yet still answers signal 0
fn is_zombie(pid: libc::pid_t) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // the command name may contain spaces and parentheses; the state follows the last ')'
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next())
        == Some('Z')
}

/// Deliver `signal`; ESRCH counts as success since the process is gone
pub fn send_signal(pid: u32, signal: libc::c_int) -> Result<()> {
    let raw = libc::pid_t::try_from(pid).map_err(|_| ServiceError::Signal {
        pid,
        source: io::Error::from(io::ErrorKind::InvalidInput),
    })?;
    // SAFETY: plain kill(2) on a positive pid
    let rc = unsafe { libc::kill(raw, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        debug!("pid {} already gone", pid);
        return Ok(());
    }
    Err(ServiceError::Signal { pid, source: err })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    #[test]
    fn test_write_read_remove() {
        let dir = TempDir::new().unwrap();
        let pid_file = PidFile::new(dir.path().join("run/mihomo.pid"));

        assert_eq!(pid_file.read(), None);
        pid_file.write(4242).unwrap();
        assert_eq!(fs::read_to_string(pid_file.path()).unwrap(), "4242");
        assert_eq!(pid_file.read(), Some(4242));

        pid_file.remove().unwrap();
        pid_file.remove().unwrap();
        assert!(!pid_file.path().exists());
    }

    #[test]
    fn test_tolerates_whitespace() {
        let dir = TempDir::new().unwrap();
        let pid_file = PidFile::new(dir.path().join("mihomo.pid"));
        fs::write(pid_file.path(), " 17\n").unwrap();
        assert_eq!(pid_file.read(), Some(17));
    }

    #[test]
    fn test_own_process_is_alive() {
        let dir = TempDir::new().unwrap();
        let pid_file = PidFile::new(dir.path().join("mihomo.pid"));
        pid_file.write(std::process::id()).unwrap();

        assert_eq!(pid_file.live_pid(), Some(std::process::id()));
        assert!(pid_file.path().exists());
    }

    #[test]
    fn test_stale_file_removed() {
        let dir = TempDir::new().unwrap();
        let pid_file = PidFile::new(dir.path().join("mihomo.pid"));

        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        pid_file.write(pid).unwrap();
        assert_eq!(pid_file.live_pid(), None);
        assert!(!pid_file.path().exists());
    }

    #[test]
    fn test_garbage_file_removed() {
        let dir = TempDir::new().unwrap();
        let pid_file = PidFile::new(dir.path().join("mihomo.pid"));
        fs::write(pid_file.path(), "not a pid").unwrap();
        assert_eq!(pid_file.live_pid(), None);
        assert!(!pid_file.path().exists());
    }

    #[test]
    fn test_uncollected_child_is_not_alive() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();

        let mut alive = true;
        for _ in 0..200 {
            alive = is_alive(pid);
            if !alive {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(!alive);
        child.wait().unwrap();
    }

    #[test]
    fn test_signal_to_reaped_process_is_ok() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        send_signal(pid, libc::SIGTERM).unwrap();
    }
}
