//! Compiled-artifact cache.
//!
//! Entries live at `<root>/<hash(paper)>/<compiler>/<hash(target)>/` and hold
//! latexmk's `aux/` and `out/` directories from the last successful build of
//! that triple, minus PDFs and SyncTeX files. Writers build a staging sibling
//! and swap it into place, so readers only ever see a complete entry.

use crate::error::{Result, TexdError};
use crate::fsutil::{self, hash_key};
use crate::now_millis;
use crate::paths::Compiler;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Marker in staging directory names; the sweeper matches on it.
pub const STAGING_MARKER: &str = ".tmp-";

const META_FILE: &str = "meta.json";

/// Whether aux/out files are reused across builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    #[default]
    Off,
    Aux,
}

impl CacheMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::Off => "off",
            CacheMode::Aux => "aux",
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheMode {
    type Err = TexdError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "" => Ok(CacheMode::Off),
            "aux" => Ok(CacheMode::Aux),
            other => Err(TexdError::invalid(format!(
                "unknown cache mode '{}' (expected off or aux)",
                other
            ))),
        }
    }
}

/// Caching applies only when the operator allows it, the request names a
/// paper, and the request asks for it. Anything else is `Off`.
pub fn resolve_cache_mode(
    operator: CacheMode,
    paper_id: Option<&str>,
    requested: Option<CacheMode>,
) -> CacheMode {
    let has_paper = paper_id.is_some_and(|p| !p.trim().is_empty());
    if operator == CacheMode::Aux && has_paper && requested == Some(CacheMode::Aux) {
        CacheMode::Aux
    } else {
        CacheMode::Off
    }
}

/// PDFs and SyncTeX files are rebuilt every run and never cached.
pub fn is_cacheable(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    !(name.ends_with(".pdf") || name.ends_with(".synctex") || name.ends_with(".synctex.gz"))
}

/// On-disk metadata of an artifact entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMeta {
    /// Unix milliseconds of the last build that used this entry.
    pub last_used: u64,
    pub paper_id: String,
    pub compiler: Compiler,
    pub target: String,
    pub cache_mode: CacheMode,
}

/// Locations making up one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntryPaths {
    pub dir: PathBuf,
    pub aux: PathBuf,
    pub out: PathBuf,
    pub meta: PathBuf,
}

impl CacheEntryPaths {
    fn at(dir: PathBuf) -> Self {
        Self {
            aux: dir.join("aux"),
            out: dir.join("out"),
            meta: dir.join(META_FILE),
            dir,
        }
    }
}

/// An entry as seen by eviction.
#[derive(Debug, Clone)]
pub struct ArtifactEntry {
    pub paths: CacheEntryPaths,
    pub meta: Option<ArtifactMeta>,
}

impl ArtifactEntry {
    /// Last use in unix ms; entries with unreadable metadata fall back to
    /// the directory mtime.
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

/// Compiled-artifact cache rooted at one directory.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    root: PathBuf,
}

impl ArtifactCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Pure function of its inputs.
    pub fn entry_paths(&self, paper_id: &str, compiler: Compiler, target: &str) -> CacheEntryPaths {
        CacheEntryPaths::at(
            self.paper_dir(paper_id)
                .join(compiler.as_str())
                .join(hash_key(target)),
        )
    }

    pub fn paper_dir(&self, paper_id: &str) -> PathBuf {
        self.root.join(hash_key(paper_id))
    }

    /// Copies a cached entry into the job's aux/out directories.
    ///
    /// Returns whether there was a hit. Errors are logged and reported as a
    /// miss; the caller then builds from scratch.
    ///
    /// A hit rewrites the entry's metadata with a fresh `last_used`. A miss
    /// writes nothing: the entry and its metadata appear only when
    /// [`persist`](Self::persist) stores a successful build, so eviction
    /// never sees metadata-only entries.
    pub fn restore(
        &self,
        paper_id: &str,
        compiler: Compiler,
        target: &str,
        aux_dst: &Path,
        out_dst: &Path,
    ) -> bool {
        let paths = self.entry_paths(paper_id, compiler, target);
        if !paths.dir.is_dir() {
            debug!(paper_id, %compiler, target, "artifact cache miss");
            return false;
        }
        let copied = fsutil::copy_tree(&paths.aux, aux_dst, |_| true)
            .and_then(|a| Ok(a + fsutil::copy_tree(&paths.out, out_dst, |_| true)?));
        match copied {
            Ok(files) => {
                info!(paper_id, %compiler, target, files, "artifact cache hit");
                let meta = ArtifactMeta {
                    last_used: now_millis(),
                    paper_id: paper_id.to_string(),
                    compiler,
                    target: target.to_string(),
                    cache_mode: CacheMode::Aux,
                };
                if let Err(e) = fsutil::write_json_atomic(&paths.meta, &meta) {
                    warn!(error = %e, "failed to refresh artifact cache metadata");
                }
                true
            }
            Err(e) => {
                warn!(paper_id, error = %e, "artifact cache restore failed, building uncached");
                let _ = fsutil::empty_dir(aux_dst);
                let _ = fsutil::empty_dir(out_dst);
                false
            }
        }
    }

    /// Replaces the entry with the job's aux/out after a successful build.
    ///
    /// The new content is assembled in `<entry>.tmp-<job_id>` and renamed
    /// over the old entry, so an interrupted persist leaves the previous
    /// entry intact.
    pub fn persist(
        &self,
        paper_id: &str,
        compiler: Compiler,
        target: &str,
        job_id: &str,
        aux_src: &Path,
        out_src: &Path,
    ) -> Result<()> {
        let paths = self.entry_paths(paper_id, compiler, target);
        let staging = staging_path(&paths.dir, job_id);
        fsutil::remove_dir_if_exists(&staging)?;

        let built = (|| -> Result<usize> {
            let staged = CacheEntryPaths::at(staging.clone());
            let mut files = fsutil::copy_tree(aux_src, &staged.aux, is_cacheable)?;
            files += fsutil::copy_tree(out_src, &staged.out, is_cacheable)?;
            fsutil::write_json_atomic(
                &staged.meta,
                &ArtifactMeta {
                    last_used: now_millis(),
                    paper_id: paper_id.to_string(),
                    compiler,
                    target: target.to_string(),
                    cache_mode: CacheMode::Aux,
                },
            )?;
            Ok(files)
        })();

        let files = match built {
            Ok(n) => n,
            Err(e) => {
                let _ = fsutil::remove_dir_if_exists(&staging);
                return Err(e);
            }
        };

        fsutil::remove_dir_if_exists(&paths.dir)?;
        if let Err(e) = fs::rename(&staging, &paths.dir) {
            let _ = fsutil::remove_dir_if_exists(&staging);
            return Err(e.into());
        }
        debug!(paper_id, %compiler, target, files, "artifact cache entry written");
        Ok(())
    }

    /// Removes every entry for `paper_id`. Returns whether anything existed.
    pub fn clear_paper(&self, paper_id: &str) -> Result<bool> {
        fsutil::remove_dir_if_exists(&self.paper_dir(paper_id))
    }

    /// Every committed entry. Staging directories are not listed.
    pub fn entries(&self) -> Result<Vec<ArtifactEntry>> {
        let mut out = Vec::new();
        for paper in read_dirs(&self.root)? {
            for compiler in read_dirs(&paper)? {
                for dir in read_dirs(&compiler)? {
                    if is_staging(&dir) {
                        continue;
                    }
                    let paths = CacheEntryPaths::at(dir);
                    let meta = fsutil::read_json(&paths.meta);
                    out.push(ArtifactEntry { paths, meta });
                }
            }
        }
        Ok(out)
    }

    /// Removes leftover staging directories. Only safe when no persist is
    /// running (startup, shutdown, or an explicit sweep).
    pub fn sweep_staging(&self) -> Result<usize> {
        let mut removed = 0;
        for paper in read_dirs(&self.root)? {
            for compiler in read_dirs(&paper)? {
                for dir in read_dirs(&compiler)? {
                    if is_staging(&dir) && fsutil::remove_dir_if_exists(&dir)? {
                        removed += 1;
                    }
                }
            }
        }
        if removed > 0 {
            info!(removed, "swept artifact cache staging directories");
        }
        Ok(removed)
    }

    /// Removes paper and compiler directories left empty by eviction.
    pub fn prune_empty_dirs(&self) {
        let Ok(papers) = read_dirs(&self.root) else {
            return;
        };
        for paper in papers {
            if let Ok(compilers) = read_dirs(&paper) {
                for compiler in compilers {
                    let _ = fs::remove_dir(&compiler);
                }
            }
            let _ = fs::remove_dir(&paper);
        }
    }
}

fn staging_path(entry_dir: &Path, job_id: &str) -> PathBuf {
    let name = entry_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    entry_dir.with_file_name(format!("{}{}{}", name, STAGING_MARKER, job_id))
}

fn is_staging(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|n| n.to_string_lossy().contains(STAGING_MARKER))
}

/// Immediate subdirectories; a missing directory has none.
pub(crate) fn read_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let iter = match fs::read_dir(dir) {
        Ok(it) => it,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut dirs = Vec::new();
    for entry in iter {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}
