//! Advisory file lock that keeps retention sweeps from overlapping.
//!
//! The scheduler and the manual `tally sweep` command both take
//! `.tally/sweep.lock` before touching expired snapshots. A second sweeper
//! that cannot get the lock within its timeout skips the run; the expired
//! records are still there for the next one.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::ErrorCode;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("{}: lock timed out after {:?} at {}", ErrorCode::LockContention.code(), .waited, .path.display())]
    Timeout { path: PathBuf, waited: Duration },

    #[error("{}: {0}", ErrorCode::StorageFailure.code())]
    Io(#[from] io::Error),
}

impl LockError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout { .. } => ErrorCode::LockContention,
            Self::Io(_) => ErrorCode::StorageFailure,
        }
    }

    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}

/// RAII guard for the exclusive sweep lock. Released on drop.
#[derive(Debug)]
pub struct SweepLock {
    file: File,
    path: PathBuf,
}

impl SweepLock {
    /// Acquire the lock, polling until `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Timeout`] if another process holds the lock for
    /// the whole timeout, or [`LockError::Io`] if the lock file cannot be
    /// created.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        let start = Instant::now();
        while file.try_lock_exclusive().is_err() {
            if start.elapsed() >= timeout {
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    waited: start.elapsed(),
                });
            }
            thread::sleep(POLL_INTERVAL);
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Explicitly release the lock.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for SweepLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    #[test]
    fn acquire_and_release() -> Result<(), LockError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sweep.lock");
        let lock = SweepLock::acquire(&path, Duration::from_millis(50))?;
        assert_eq!(lock.path(), path.as_path());
        lock.release();

        let again = SweepLock::acquire(&path, Duration::from_millis(50))?;
        again.release();
        Ok(())
    }

    #[test]
    fn second_sweeper_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sweep.lock");
        let _held = SweepLock::acquire(&path, Duration::from_millis(50)).unwrap();

        let err = SweepLock::acquire(&path, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, LockError::Timeout { ref path, .. } if path.ends_with("sweep.lock")));
        assert_eq!(err.code(), ErrorCode::LockContention);
        assert!(err.hint().is_some());
    }

    #[test]
    fn lock_is_free_after_holder_thread_finishes() -> Result<(), LockError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sweep.lock");
        let held = Arc::new(Barrier::new(2));
        let done = Arc::new(Barrier::new(2));

        let (held_t, done_t, path_t) = (Arc::clone(&held), Arc::clone(&done), path.clone());
        let handle = thread::spawn(move || {
            let _lock = SweepLock::acquire(&path_t, Duration::from_millis(200)).unwrap();
            held_t.wait();
            done_t.wait();
        });

        held.wait();
        assert!(SweepLock::acquire(&path, Duration::from_millis(20)).is_err());
        done.wait();
        handle.join().unwrap();

        SweepLock::acquire(&path, Duration::from_millis(50))?.release();
        Ok(())
    }
}
