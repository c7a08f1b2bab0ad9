//! Cross-process liveness of task runs on one host.
//!
//! The process that runs a task holds an exclusive `flock` on
//! `<dir>/<task_id>.lock` for as long as its queue is alive. The OS drops
//! the lock when that process exits, crashed or not, so a lock that can be
//! taken means nobody on this host is running the task any more.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;

use tracing::debug;

use autopilot_core::ServiceError;

pub struct RunLocks {
    dir: PathBuf,
}

impl RunLocks {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Take the run lock of a task without blocking. `None` means another
    /// open handle, usually another process, holds it.
    pub fn try_acquire(&self, task_id: &str) -> Result<Option<RunLock>, ServiceError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            ServiceError::Storage(format!("create lock dir {}: {e}", self.dir.display()))
        })?;
        let path = self.dir.join(format!("{task_id}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| ServiceError::Storage(format!("open {}: {e}", path.display())))?;

        if lock_exclusive(&file)
            .map_err(|e| ServiceError::Storage(format!("lock {}: {e}", path.display())))?
        {
            Ok(Some(RunLock { file }))
        } else {
            debug!(path = %path.display(), "run lock held elsewhere");
            Ok(None)
        }
    }
}

/// Held run lock; released on drop. The file itself stays so that every
/// process locks the same inode.
#[derive(Debug)]
pub struct RunLock {
    file: File,
}

impl Drop for RunLock {
    fn drop(&mut self) {
        unlock(&self.file);
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;

    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

// No cross-process detection off unix: every lock is granted.
#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> std::io::Result<bool> {
    Ok(true)
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}
