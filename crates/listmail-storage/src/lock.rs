//! Advisory file locks shared between delivery agent processes

use listmail_common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How long to sleep between attempts on a contended lock
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// An exclusive `flock(2)` lock, released when dropped
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the lock on `path` is held or `timeout` expires.
    ///
    /// The lock file is created if missing and never removed, so that
    /// every process locks the same inode.
    pub async fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                Error::Storage(format!("Failed to open lock file {}: {}", path.display(), e))
            })?;

        let deadline = Instant::now() + timeout;
        let mut contended = false;

        loop {
            if try_lock(&file)? {
                if contended {
                    debug!(path = %path.display(), "Acquired contended lock");
                }
                return Ok(Self {
                    file,
                    path: path.to_path_buf(),
                });
            }

            if Instant::now() >= deadline {
                warn!(path = %path.display(), timeout = ?timeout, "Lock wait timed out");
                return Err(Error::LockTimeout(path.display().to_string()));
            }

            contended = true;
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // SAFETY: the descriptor is owned by `self.file` and still open.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

fn try_lock(file: &File) -> Result<bool> {
    // SAFETY: the descriptor is owned by `file` and still open.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EWOULDBLOCK || code == libc::EINTR => Ok(false),
        _ => Err(Error::Storage(format!("flock failed: {}", err))),
    }
}
