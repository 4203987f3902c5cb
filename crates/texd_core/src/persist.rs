//! Persistent working trees, one per paper.
//!
//! Layout of an entry at `<root>/<hash(paper)>/`:
//!
//! ```text
//! repo/       git working tree, updated in place
//! aux/ out/   latexmk output shared across builds of this paper
//! meta.json   PersistMeta
//! .lock       RepoLock file, present while a build owns the entry
//! ```
//!
//! Every mutation happens under the entry's lock.

use crate::error::Result;
use crate::fsutil::{self, hash_key};
use crate::lock::{LockOptions, RepoLock};
use crate::paths::Compiler;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const LOCK_FILE: &str = ".lock";
const META_FILE: &str = "meta.json";

/// Metadata of a persistent entry. `git_url` never carries credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PersistMeta {
    /// Unix milliseconds.
    pub last_used: u64,
    pub git_url: String,
    pub branch: String,
    pub paper_id: String,
    pub target: String,
    pub compiler: Compiler,
    /// Sparse set the tree was last checked out with; `None` for a full tree.
    #[serde(default)]
    pub sparse_paths: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoEntryPaths {
    pub dir: PathBuf,
    pub repo: PathBuf,
    pub aux: PathBuf,
    pub out: PathBuf,
    pub meta: PathBuf,
    pub lock: PathBuf,
}

impl RepoEntryPaths {
    fn at(dir: PathBuf) -> Self {
        Self {
            repo: dir.join("repo"),
            aux: dir.join("aux"),
            out: dir.join("out"),
            meta: dir.join(META_FILE),
            lock: dir.join(LOCK_FILE),
            dir,
        }
    }
}

/// What the request intends to build.
#[derive(Debug, Clone, Copy)]
pub struct BuildKey<'a> {
    pub git_url: &'a str,
    pub branch: &'a str,
    pub target: &'a str,
    pub compiler: Compiler,
}

/// How an entry was brought in line with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preparation {
    /// No usable tree; clone from scratch.
    Fresh,
    /// Remote or branch changed; the old tree was discarded.
    Rebuilt,
    /// Same tree, but target or compiler changed so aux/out were emptied.
    OutputsCleared,
    /// Same tree and outputs; update incrementally.
    Reuse,
}

impl Preparation {
    pub fn needs_clone(&self) -> bool {
        matches!(self, Preparation::Fresh | Preparation::Rebuilt)
    }
}

/// An entry as seen by eviction.
#[derive(Debug, Clone)]
pub struct RepoEntry {
    pub paths: RepoEntryPaths,
    pub meta: Option<PersistMeta>,
}

impl RepoEntry {
    /// Last use in unix ms, falling back to the directory mtime.
    pub fn last_used(&self) -> u64 {
        if let Some(meta) = &self.meta {
            return meta.last_used;
        }
        fs::metadata(&self.paths.dir)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct PersistentRepoCache {
    root: PathBuf,
}

impl PersistentRepoCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_paths(&self, paper_id: &str) -> RepoEntryPaths {
        RepoEntryPaths::at(self.root.join(hash_key(paper_id)))
    }

    /// Waits for exclusive ownership of the paper's entry.
    pub async fn lock(&self, paper_id: &str, opts: LockOptions) -> Result<RepoLock> {
        RepoLock::acquire(&self.entry_paths(paper_id).lock, opts).await
    }

    pub fn read_meta(&self, paper_id: &str) -> Option<PersistMeta> {
        fsutil::read_json(&self.entry_paths(paper_id).meta)
    }

    pub fn write_meta(&self, meta: &PersistMeta) -> Result<()> {
        fsutil::write_json_atomic(&self.entry_paths(&meta.paper_id).meta, meta)
    }

    /// Reconciles the entry with `key`. Caller must hold the lock.
    ///
    /// A changed remote or branch discards the whole tree; a changed target
    /// or compiler only empties aux/out.
    pub fn prepare(&self, paper_id: &str, key: &BuildKey<'_>) -> Result<Preparation> {
        let paths = self.entry_paths(paper_id);
        let meta = self.read_meta(paper_id);
        let has_tree = paths.repo.join(".git").exists();

        let prep = match (&meta, has_tree) {
            (_, false) => {
                fsutil::remove_dir_if_exists(&paths.repo)?;
                fsutil::empty_dir(&paths.aux)?;
                fsutil::empty_dir(&paths.out)?;
                Preparation::Fresh
            }
            (None, true) => {
                fsutil::remove_dir_if_exists(&paths.repo)?;
                fsutil::empty_dir(&paths.aux)?;
                fsutil::empty_dir(&paths.out)?;
                Preparation::Rebuilt
            }
            (Some(m), true) if m.git_url != key.git_url || m.branch != key.branch => {
                info!(paper_id, "remote or branch changed, rebuilding persistent tree");
                fsutil::remove_dir_if_exists(&paths.repo)?;
                fsutil::empty_dir(&paths.aux)?;
                fsutil::empty_dir(&paths.out)?;
                Preparation::Rebuilt
            }
            (Some(m), true) if m.target != key.target || m.compiler != key.compiler => {
                info!(paper_id, "target or compiler changed, clearing build outputs");
                fsutil::empty_dir(&paths.aux)?;
                fsutil::empty_dir(&paths.out)?;
                Preparation::OutputsCleared
            }
            _ => {
                fs::create_dir_all(&paths.aux)?;
                fs::create_dir_all(&paths.out)?;
                Preparation::Reuse
            }
        };
        Ok(prep)
    }

    /// Removes the paper's entry, waiting for any build that holds it.
    pub async fn clear_paper(&self, paper_id: &str, opts: LockOptions) -> Result<bool> {
        let paths = self.entry_paths(paper_id);
        if !paths.dir.exists() {
            return Ok(false);
        }
        let lock = RepoLock::acquire(&paths.lock, opts).await?;
        remove_entry_contents(&paths)?;
        drop(lock);
        let _ = fs::remove_dir(&paths.dir);
        Ok(true)
    }

    pub fn entries(&self) -> Result<Vec<RepoEntry>> {
        Ok(crate::cache::read_dirs(&self.root)?
            .into_iter()
            .map(|dir| {
                let paths = RepoEntryPaths::at(dir);
                let meta = fsutil::read_json(&paths.meta);
                RepoEntry { paths, meta }
            })
            .collect())
    }
}

/// Removes everything in the entry except the lock file.
pub(crate) fn remove_entry_contents(paths: &RepoEntryPaths) -> Result<()> {
    for entry in fs::read_dir(&paths.dir)? {
        let entry = entry?;
        let path = entry.path();
        if path == paths.lock {
            continue;
        }
        if entry.file_type()?.is_dir() {
            fsutil::remove_dir_if_exists(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
