//! Advisory lock files guarding persistent working trees.
//!
//! A lock is a file created with `create_new` whose content records who took
//! it and when. Holders are trusted to release; a lock older than the stale
//! threshold is assumed abandoned by a crashed process and may be removed by
//! anyone. The recorded pid is informational only.

use crate::error::{Result, TexdError};
use crate::now_millis;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Content of a lock file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub pid: u32,
    /// Unix milliseconds.
    pub created_at: u64,
}

/// Timing for [`RepoLock::acquire`].
#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    /// Give up after waiting this long for a fresh lock.
    pub timeout: Duration,
    /// Locks older than this are removed and re-taken.
    pub stale: Duration,
    /// Sleep between attempts.
    pub poll: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            stale: Duration::from_secs(15 * 60),
            poll: Duration::from_millis(500),
        }
    }
}

impl From<&crate::config::LockConfig> for LockOptions {
    fn from(cfg: &crate::config::LockConfig) -> Self {
        Self {
            timeout: cfg.wait(),
            stale: cfg.stale(),
            poll: cfg.poll(),
        }
    }
}

/// Observed state of a lock path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Absent,
    Held { age: Duration },
    Stale { age: Duration },
}

/// RAII guard for an acquired lock.
///
/// The lock file is removed when the guard is dropped, so the lock is
/// released on every exit path of the critical section.
#[derive(Debug)]
pub struct RepoLock {
    path: PathBuf,
    released: bool,
}

impl RepoLock {
    /// Acquires the lock at `path`, polling until `opts.timeout`.
    ///
    /// Stale locks are removed and retried immediately. Waiting sleeps on the
    /// async runtime, never blocking other tasks.
    pub async fn acquire(path: &Path, opts: LockOptions) -> Result<RepoLock> {
        let deadline = Instant::now() + opts.timeout;
        let mut logged_wait = false;
        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(lock);
            }

            match inspect(path, opts.stale) {
                LockState::Stale { age } => {
                    if reclaim_stale(path, opts.stale)? {
                        warn!(
                            path = %path.display(),
                            age_secs = age.as_secs(),
                            "removed stale lock"
                        );
                    }
                    continue;
                }
                LockState::Absent => continue,
                LockState::Held { age } => {
                    if !logged_wait {
                        debug!(path = %path.display(), age_ms = age.as_millis() as u64, "waiting for lock");
                        logged_wait = true;
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(TexdError::LockTimeout {
                    path: path.to_path_buf(),
                });
            }
            tokio::time::sleep(opts.poll).await;
        }
    }

    /// One non-blocking attempt. `Ok(None)` means someone else holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<RepoLock>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let info = LockInfo {
                    pid: std::process::id(),
                    created_at: now_millis(),
                };
                let body = serde_json::to_vec(&info)?;
                let written = file.write_all(&body).and_then(|_| file.flush());
                if let Err(e) = written {
                    let _ = fs::remove_file(path);
                    return Err(TexdError::Io(e));
                }
                debug!(path = %path.display(), "lock acquired");
                Ok(Some(RepoLock {
                    path: path.to_path_buf(),
                    released: false,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(TexdError::Io(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Releases the lock now instead of at drop.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "lock released"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to release lock"),
        }
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Reads the lock's recorded creation time, falling back to the file mtime.
pub fn lock_created_at(path: &Path) -> Option<SystemTime> {
    if let Ok(bytes) = fs::read(path) {
        if let Ok(info) = serde_json::from_slice::<LockInfo>(&bytes) {
            return Some(UNIX_EPOCH + Duration::from_millis(info.created_at));
        }
    }
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Classifies the lock at `path` against the stale threshold.
pub fn inspect(path: &Path, stale: Duration) -> LockState {
    if !path.exists() {
        return LockState::Absent;
    }
    let Some(created) = lock_created_at(path) else {
        // Vanished between the exists check and the read.
        return LockState::Absent;
    };
    // A timestamp from the future counts as brand new.
    let age = SystemTime::now()
        .duration_since(created)
        .unwrap_or(Duration::ZERO);
    if age > stale {
        LockState::Stale { age }
    } else {
        LockState::Held { age }
    }
}

/// Removes the lock at `path` if, and only if, it is still the same stale lock.
///
/// The file is first renamed to a unique tombstone so that two reclaimers
/// racing on the same stale lock cannot delete a fresh lock taken by the
/// winner in between. If the tombstone turns out to hold a different (fresh)
/// lock, it is linked back into place.
pub fn reclaim_stale(path: &Path, stale: Duration) -> Result<bool> {
    let before = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(TexdError::Io(e)),
    };
    if !matches!(inspect(path, stale), LockState::Stale { .. }) {
        return Ok(false);
    }

    let tombstone = path.with_extension(format!("stale-{}", uuid::Uuid::new_v4()));
    match fs::rename(path, &tombstone) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(TexdError::Io(e)),
    }

    let moved = fs::read(&tombstone).unwrap_or_default();
    if moved != before {
        // Someone reclaimed first and we moved their fresh lock; put it back.
        if let Err(e) = fs::hard_link(&tombstone, path) {
            warn!(path = %path.display(), error = %e, "failed to restore lock moved during reclaim");
        }
        let _ = fs::remove_file(&tombstone);
        return Ok(false);
    }
    let _ = fs::remove_file(&tombstone);
    Ok(true)
}

/// Removes a lock file; a concurrent removal is not an error.
pub fn remove_lock_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(TexdError::Io(e)),
    }
}
