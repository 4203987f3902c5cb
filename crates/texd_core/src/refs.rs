//! Remote ref resolution with a short-lived in-memory cache.

use crate::error::Result;
use crate::git::{self, CommitDetails, RemoteRefs};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long a resolved ref is reused.
pub const REFS_TTL: Duration = Duration::from_secs(10);

/// Response body of a refs lookup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RefsInfo {
    pub sha: String,
    pub default_branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unchanged: Option<bool>,
    #[serde(flatten)]
    pub details: Option<CommitDetails>,
}

/// Network side of ref resolution.
#[async_trait]
pub trait RefSource: Send + Sync {
    async fn ls_remote_symref(&self, url: &str, branch: Option<&str>) -> Result<RemoteRefs>;
    async fn ls_remote_all(&self, url: &str) -> Result<RemoteRefs>;
    async fn commit_details(&self, url: &str, sha: &str, branch: &str) -> Result<CommitDetails>;
}

/// [`RefSource`] backed by the git binary. Commit lookups use throwaway
/// bare repositories under `scratch_root`.
pub struct GitRefSource {
    pub scratch_root: PathBuf,
    pub timeout: Duration,
}

#[async_trait]
impl RefSource for GitRefSource {
    async fn ls_remote_symref(&self, url: &str, branch: Option<&str>) -> Result<RemoteRefs> {
        git::ls_remote_symref(url, branch, self.timeout).await
    }

    async fn ls_remote_all(&self, url: &str) -> Result<RemoteRefs> {
        git::ls_remote_all(url, self.timeout).await
    }

    async fn commit_details(&self, url: &str, sha: &str, branch: &str) -> Result<CommitDetails> {
        let job = crate::workdir::JobDir::create(&self.scratch_root)?;
        git::fetch_commit_details(url, sha, branch, job.path(), self.timeout).await
    }
}

#[derive(Debug, Clone)]
struct CachedRef {
    sha: String,
    default_branch: String,
    details: Option<CommitDetails>,
    at: Instant,
}

/// `(url, branch)` to last resolution, valid for [`REFS_TTL`].
///
/// Keys use the credential-free URL so tokens never sit in memory longer
/// than the request that carried them.
#[derive(Debug)]
pub struct RefsCache {
    ttl: Duration,
    entries: Mutex<HashMap<(String, String), CachedRef>>,
}

impl Default for RefsCache {
    fn default() -> Self {
        Self::new(REFS_TTL)
    }
}

impl RefsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, key: &(String, String)) -> Option<CachedRef> {
        let mut map = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        map.retain(|_, v| v.at.elapsed() < self.ttl);
        map.get(key).cloned()
    }

    fn put(&self, key: (String, String), value: CachedRef) {
        let mut map = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        map.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves the default branch and tip sha for `branch` (or HEAD).
    ///
    /// `cache_url` is the credential-free form of `url`. When `known_sha`
    /// matches the resolved sha, the commit lookup is skipped and
    /// `unchanged: true` is returned.
    pub async fn resolve(
        &self,
        source: &dyn RefSource,
        url: &str,
        cache_url: &str,
        branch: Option<&str>,
        known_sha: Option<&str>,
    ) -> Result<RefsInfo> {
        let key = (cache_url.to_string(), branch.unwrap_or_default().to_string());

        let mut entry = match self.get(&key) {
            Some(hit) => {
                debug!(url = %cache_url, "refs cache hit");
                hit
            }
            None => {
                let (sha, default_branch) = resolve_remote(source, url, branch).await?;
                CachedRef {
                    sha,
                    default_branch,
                    details: None,
                    at: Instant::now(),
                }
            }
        };

        if known_sha.is_some_and(|k| k == entry.sha) {
            self.put(key, entry.clone());
            return Ok(RefsInfo {
                sha: entry.sha,
                default_branch: entry.default_branch,
                unchanged: Some(true),
                details: None,
            });
        }

        let details = match &entry.details {
            Some(d) => d.clone(),
            None => {
                let lookup_branch = branch.unwrap_or(&entry.default_branch);
                match source.commit_details(url, &entry.sha, lookup_branch).await {
                    Ok(d) => {
                        entry.details = Some(d.clone());
                        d
                    }
                    Err(e) => {
                        warn!(url = %cache_url, error = %e, "commit lookup failed, using fallback date");
                        fallback_details()
                    }
                }
            }
        };
        self.put(key, entry.clone());

        Ok(RefsInfo {
            sha: entry.sha,
            default_branch: entry.default_branch,
            unchanged: None,
            details: Some(details),
        })
    }
}

async fn resolve_remote(
    source: &dyn RefSource,
    url: &str,
    branch: Option<&str>,
) -> Result<(String, String)> {
    let probe = source.ls_remote_symref(url, branch).await?;
    if let Some(found) = pick(&probe, branch) {
        return Ok(found);
    }
    debug!("symref probe incomplete, listing all heads");
    let full = source.ls_remote_all(url).await?;
    let merged = RemoteRefs {
        default_branch: probe.default_branch.or(full.default_branch.clone()),
        head_sha: probe.head_sha.or(full.head_sha.clone()),
        branches: full.branches,
    };
    pick(&merged, branch).ok_or_else(|| {
        crate::TexdError::NotFound(match branch {
            Some(b) => format!("branch '{}' not found on remote", b),
            None => "remote has no default branch".to_string(),
        })
    })
}

fn pick(refs: &RemoteRefs, branch: Option<&str>) -> Option<(String, String)> {
    let default_branch = refs.infer_default_branch()?;
    let sha = match branch {
        Some(b) => refs.branch_sha(b)?.to_string(),
        None => refs
            .head_sha
            .clone()
            .or_else(|| refs.branch_sha(&default_branch).map(str::to_string))?,
    };
    Some((sha, default_branch))
}

fn fallback_details() -> CommitDetails {
    CommitDetails {
        message: String::new(),
        date: chrono::Utc::now().to_rfc3339(),
        date_is_fallback: true,
        author_name: String::new(),
        author_email: String::new(),
    }
}
