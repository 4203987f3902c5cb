//! Job-scoped scratch directories.
//!
//! A [`JobDir`] owns a unique directory under the jobs root and removes it
//! when dropped, so every exit path (early return, `?`, panic unwind, task
//! cancellation) cleans up. [`sweep`] removes directories left behind by a
//! previous instance that crashed before its guards ran.

use crate::error::Result;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Prefix of every job directory name; [`sweep`] only touches these.
const JOB_DIR_PREFIX: &str = "job-";

/// An ephemeral unit of work: an id and a directory that dies with it.
#[derive(Debug)]
pub struct JobDir {
    id: Uuid,
    path: PathBuf,
    /// Cleared by [`JobDir::keep`].
    armed: bool,
}

impl JobDir {
    /// Creates `<root>/job-<uuid>`.
    pub fn create(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        let id = Uuid::new_v4();
        let path = root.join(format!("{}{}", JOB_DIR_PREFIX, id));
        fs::create_dir(&path)?;
        debug!(job_id = %id, path = %path.display(), "created job directory");
        Ok(Self {
            id,
            path,
            armed: true,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates (if needed) and returns a subdirectory of the job directory.
    pub fn subdir(&self, name: &str) -> Result<PathBuf> {
        let dir = self.path.join(name);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Disarms cleanup and returns the path. Used by tests that inspect output.
    pub fn keep(mut self) -> PathBuf {
        self.armed = false;
        self.path.clone()
    }
}

impl Drop for JobDir {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        remove_dir_logged(&self.path);
    }
}

/// Runs `f` and removes `dir` afterwards, whatever `f` returns.
///
/// The removal also happens if the returned future is dropped before
/// completion.
pub async fn with_cleanup<F, Fut, T>(dir: PathBuf, f: F) -> T
where
    F: FnOnce(PathBuf) -> Fut,
    Fut: Future<Output = T>,
{
    struct Cleanup(PathBuf);
    impl Drop for Cleanup {
        fn drop(&mut self) {
            remove_dir_logged(&self.0);
        }
    }

    let guard = Cleanup(dir.clone());
    let out = f(dir).await;
    drop(guard);
    out
}

fn remove_dir_logged(path: &Path) {
    match fs::remove_dir_all(path) {
        Ok(()) => debug!(path = %path.display(), "removed job directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove job directory"),
    }
}

/// Removes every job directory under `root`. Returns how many were removed.
///
/// Must only run when no jobs are active (startup, or after draining).
pub fn sweep(root: &Path) -> Result<usize> {
    if !root.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(JOB_DIR_PREFIX) {
            continue;
        }
        match fs::remove_dir_all(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %entry.path().display(), error = %e, "sweep failed to remove directory"),
        }
    }
    if removed > 0 {
        info!(removed, root = %root.display(), "swept leftover job directories");
    }
    Ok(removed)
}
