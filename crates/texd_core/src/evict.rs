//! TTL and size-bounded eviction for both cache layers.
//!
//! Each layer is evicted independently:
//! 1. **TTL pass**: delete entries unused for longer than the TTL
//! 2. **Size pass**: while the remaining total exceeds the cap, delete the
//!    least recently used entry
//!
//! Persistent entries whose lock is fresh are never candidates. A stale lock
//! is removed first and the entry is then treated as unlocked.

use crate::cache::ArtifactCache;
use crate::error::Result;
use crate::fsutil;
use crate::lock::{self, LockState, RepoLock};
use crate::now_millis;
use crate::persist::{self, PersistentRepoCache};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Progress callback, called with (current, total, phase).
pub type EvictionProgressCallback = dyn Fn(usize, usize, &str) + Send + Sync;

/// Bounds for one cache layer.
#[derive(Debug, Clone, Copy)]
pub struct LayerLimits {
    pub ttl: Duration,
    pub max_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct EvictionConfig {
    /// Report what would be deleted without deleting.
    pub dry_run: bool,
    pub artifacts: LayerLimits,
    pub repos: LayerLimits,
    /// Persistent-repo locks older than this are reclaimed.
    pub lock_stale: Duration,
}

impl EvictionConfig {
    pub fn from_config(config: &crate::Config) -> Self {
        Self {
            dry_run: false,
            artifacts: LayerLimits {
                ttl: config.cache.ttl(),
                max_bytes: config.cache.max_bytes(),
            },
            repos: LayerLimits {
                ttl: config.persist.ttl(),
                max_bytes: config.persist.max_bytes(),
            },
            lock_stale: config.lock.stale(),
        }
    }
}

/// Outcome of an eviction run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvictionReport {
    /// Entries examined across both layers.
    pub entries_scanned: usize,

    /// Entries deleted (or that would be, in dry-run mode).
    pub entries_deleted: usize,

    /// Bytes freed by deletion.
    pub bytes_freed: u64,

    /// Persistent entries skipped because a fresh lock was held.
    pub skipped_locked: usize,

    /// Stale locks removed before evaluation.
    pub stale_locks_removed: usize,

    /// Errors encountered during eviction (non-fatal).
    pub errors: Vec<String>,
}

/// A deletion candidate.
#[derive(Debug, Clone)]
struct Candidate {
    dir: PathBuf,
    last_used: u64,
    size: u64,
}

/// Picks the candidates to delete: TTL first, then LRU down to `max_bytes`.
/// Returns indices into `candidates`.
fn plan(candidates: &[Candidate], limits: LayerLimits, now_ms: u64) -> Vec<usize> {
    let ttl_ms = limits.ttl.as_millis() as u64;
    let cutoff = now_ms.saturating_sub(ttl_ms);

    let mut doomed: Vec<usize> = Vec::new();
    let mut kept: Vec<usize> = Vec::new();
    for (i, c) in candidates.iter().enumerate() {
        if c.last_used < cutoff {
            doomed.push(i);
        } else {
            kept.push(i);
        }
    }

    let mut total: u64 = kept.iter().map(|&i| candidates[i].size).sum();
    kept.sort_by_key(|&i| (candidates[i].last_used, candidates[i].dir.clone()));
    for i in kept {
        if total <= limits.max_bytes {
            break;
        }
        total = total.saturating_sub(candidates[i].size);
        doomed.push(i);
    }
    doomed
}

/// Runs eviction over both layers.
pub fn evict(
    artifacts: &ArtifactCache,
    repos: &PersistentRepoCache,
    config: &EvictionConfig,
    progress: Option<&EvictionProgressCallback>,
) -> Result<EvictionReport> {
    let mut report = EvictionReport::default();

    if let Some(cb) = progress {
        cb(0, 2, "artifacts");
    }
    evict_artifacts(artifacts, config, &mut report)?;

    if let Some(cb) = progress {
        cb(1, 2, "repos");
    }
    evict_repos(repos, config, &mut report)?;

    if let Some(cb) = progress {
        cb(2, 2, "done");
    }

    if report.entries_deleted > 0 || report.stale_locks_removed > 0 {
        info!(
            dry_run = config.dry_run,
            scanned = report.entries_scanned,
            deleted = report.entries_deleted,
            bytes_freed = report.bytes_freed,
            stale_locks = report.stale_locks_removed,
            "eviction finished"
        );
    } else {
        debug!(scanned = report.entries_scanned, "eviction found nothing to delete");
    }
    Ok(report)
}

fn evict_artifacts(
    cache: &ArtifactCache,
    config: &EvictionConfig,
    report: &mut EvictionReport,
) -> Result<()> {
    let candidates: Vec<Candidate> = cache
        .entries()?
        .into_iter()
        .map(|e| Candidate {
            last_used: e.last_used(),
            size: fsutil::dir_size(&e.paths.dir),
            dir: e.paths.dir,
        })
        .collect();
    report.entries_scanned += candidates.len();

    for i in plan(&candidates, config.artifacts, now_millis()) {
        let c = &candidates[i];
        if config.dry_run {
            report.entries_deleted += 1;
            report.bytes_freed += c.size;
            continue;
        }
        match fsutil::remove_dir_if_exists(&c.dir) {
            Ok(_) => {
                report.entries_deleted += 1;
                report.bytes_freed += c.size;
            }
            Err(e) => report
                .errors
                .push(format!("{}: {}", c.dir.display(), e)),
        }
    }
    if !config.dry_run {
        cache.prune_empty_dirs();
    }
    Ok(())
}

fn evict_repos(
    cache: &PersistentRepoCache,
    config: &EvictionConfig,
    report: &mut EvictionReport,
) -> Result<()> {
    let mut candidates = Vec::new();
    for entry in cache.entries()? {
        report.entries_scanned += 1;
        match lock::inspect(&entry.paths.lock, config.lock_stale) {
            LockState::Held { .. } => {
                report.skipped_locked += 1;
                continue;
            }
            LockState::Stale { age } => {
                if config.dry_run {
                    report.stale_locks_removed += 1;
                } else {
                    match lock::reclaim_stale(&entry.paths.lock, config.lock_stale) {
                        Ok(true) => {
                            warn!(
                                path = %entry.paths.lock.display(),
                                age_secs = age.as_secs(),
                                "removed stale lock during eviction"
                            );
                            report.stale_locks_removed += 1;
                        }
                        Ok(false) => {
                            // Reclaimed by someone else, who now holds it.
                            report.skipped_locked += 1;
                            continue;
                        }
                        Err(e) => {
                            report.errors.push(format!("{}: {}", entry.paths.lock.display(), e));
                            continue;
                        }
                    }
                }
            }
            LockState::Absent => {}
        }
        candidates.push((
            Candidate {
                last_used: entry.last_used(),
                size: fsutil::dir_size(&entry.paths.dir),
                dir: entry.paths.dir.clone(),
            },
            entry.paths,
        ));
    }

    let plain: Vec<Candidate> = candidates.iter().map(|(c, _)| c.clone()).collect();
    for i in plan(&plain, config.repos, now_millis()) {
        let (c, paths) = &candidates[i];
        if config.dry_run {
            report.entries_deleted += 1;
            report.bytes_freed += c.size;
            continue;
        }
        // Take the lock so a build that started since the scan is not
        // deleted out from under it.
        let guard = match RepoLock::try_acquire(&paths.lock) {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                report.skipped_locked += 1;
                continue;
            }
            Err(e) => {
                report.errors.push(format!("{}: {}", paths.lock.display(), e));
                continue;
            }
        };
        match persist::remove_entry_contents(paths) {
            Ok(()) => {
                report.entries_deleted += 1;
                report.bytes_freed += c.size;
            }
            Err(e) => report.errors.push(format!("{}: {}", c.dir.display(), e)),
        }
        drop(guard);
        let _ = fs::remove_dir(&c.dir);
    }
    Ok(())
}
