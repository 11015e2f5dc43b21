//! OS-advisory exclusive file lock with a bounded acquisition timeout.
//!
//! Protects the state document and the global scratch file. The lock is held
//! on a sibling `.lock` file, never on the data file itself, so atomic
//! renames over the data file do not disturb lock holders.

use crate::errors::OrchestratorError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Default lock acquisition timeout.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(60);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// An acquired exclusive lock; released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquire an exclusive lock on `path`, polling until `timeout` elapses.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, OrchestratorError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|source| OrchestratorError::StateWriteFailed {
                path: path.to_path_buf(),
                source,
            })?;

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    })
                }
                Err(_) if Instant::now() < deadline => std::thread::sleep(POLL_INTERVAL),
                Err(_) => {
                    return Err(OrchestratorError::LockTimeout {
                        path: path.to_path_buf(),
                        seconds: timeout.as_secs(),
                    })
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Unlock errors on drop are unreportable; the OS releases the lock
        // when the descriptor closes anyway.
        let _ = fs2::FileExt::unlock(&self.file);
    }
}
