//! Repository-wide advisory lock
//!
//! Appends to any notes ref of a repository are serialized through an
//! exclusive `flock` on `<git-dir>/gitmem.lock`. Acquisition retries with
//! exponential backoff and random jitter and gives up with
//! [`MemoryError::LockTimeout`] after a bounded number of attempts.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};

/// File name of the lock inside the git directory
pub const LOCK_FILE_NAME: &str = "gitmem.lock";

/// Retry schedule for [`RepoLock::acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay_ms: 25,
            max_delay_ms: 2_000,
        }
    }
}

impl LockPolicy {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
    /// capped at `max`, scaled by a jitter factor in `[0.5, 1.5)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(20))
            .min(self.max_delay_ms);
        let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_millis((exp as f64 * jitter) as u64)
    }
}

/// Exclusive lock over one repository
#[derive(Debug, Clone)]
pub struct RepoLock {
    path: PathBuf,
    policy: LockPolicy,
}

impl RepoLock {
    /// Lock living inside `git_dir`
    pub fn for_git_dir(git_dir: &Path, policy: LockPolicy) -> Self {
        Self::new(git_dir.join(LOCK_FILE_NAME), policy)
    }

    pub fn new(path: impl Into<PathBuf>, policy: LockPolicy) -> Self {
        Self {
            path: path.into(),
            policy,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> &LockPolicy {
        &self.policy
    }

    /// Block until the lock is held or the attempt budget is spent
    pub fn acquire(&self) -> Result<RepoLockGuard> {
        let attempts = self.policy.max_attempts.max(1);
        for attempt in 0..attempts {
            if let Some(guard) = self.try_acquire()? {
                if attempt > 0 {
                    log::debug!(
                        "Acquired {} after {} attempts",
                        self.path.display(),
                        attempt + 1
                    );
                }
                return Ok(guard);
            }
            if attempt + 1 < attempts {
                std::thread::sleep(self.policy.delay_for(attempt));
            }
        }

        log::warn!(
            "Giving up on {} after {} attempts",
            self.path.display(),
            attempts
        );
        Err(MemoryError::LockTimeout {
            path: self.path.clone(),
            attempts,
        })
    }

    /// One non-blocking attempt
    pub fn try_acquire(&self) -> Result<Option<RepoLockGuard>> {
        imp::try_lock(&self.path)
    }
}

/// Held lock; released on drop
#[derive(Debug)]
pub struct RepoLockGuard {
    #[allow(dead_code)]
    file: File,
    #[cfg(not(unix))]
    path: PathBuf,
}

#[cfg(unix)]
mod imp {
    use std::os::unix::io::AsRawFd;

    use super::*;

    pub(super) fn try_lock(path: &Path) -> Result<Option<RepoLockGuard>> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        // SAFETY: the descriptor is owned by `file` and stays open for the call
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(Some(RepoLockGuard { file }));
        }

        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock {
            Ok(None)
        } else {
            Err(err.into())
        }
    }

    impl Drop for RepoLockGuard {
        fn drop(&mut self) {
            // SAFETY: see try_lock; closing the file would also release it
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use super::*;

    pub(super) fn try_lock(path: &Path) -> Result<Option<RepoLockGuard>> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => Ok(Some(RepoLockGuard {
                file,
                path: path.to_path_buf(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    impl Drop for RepoLockGuard {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
