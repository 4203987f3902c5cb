//! JSON request and response bodies of the HTTP interface.
//!
//! Field names are camelCase on the wire. Validation happens in
//! [`crate::service`], not during deserialization, so malformed values
//! produce a descriptive 400 instead of a generic decode error.

use crate::git::GitAuth;
use crate::progress::ProgressCallback;
use crate::queue::QueueStats;
use serde::{Deserialize, Serialize};

/// Branch compiled when the request does not name one.
pub const DEFAULT_BRANCH: &str = "main";

fn default_compiler() -> String {
    "pdflatex".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileRequest {
    pub git_url: String,
    #[serde(default)]
    pub branch: Option<String>,
    pub target: String,
    #[serde(default)]
    pub auth: Option<GitAuth>,
    #[serde(default = "default_compiler")]
    pub compiler: String,
    #[serde(default)]
    pub progress_callback: Option<ProgressCallback>,
    /// `"off"` or `"aux"`; parsed by the service.
    #[serde(default)]
    pub cache_mode: Option<String>,
    #[serde(default)]
    pub paper_id: Option<String>,
    #[serde(default)]
    pub known_dependencies: Option<Vec<String>>,
}

impl CompileRequest {
    /// Minimal request for `target` on `git_url`'s default branch.
    pub fn new(git_url: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            git_url: git_url.into(),
            branch: None,
            target: target.into(),
            auth: None,
            compiler: default_compiler(),
            progress_callback: None,
            cache_mode: None,
            paper_id: None,
            known_dependencies: None,
        }
    }

    pub fn branch_or_default(&self) -> &str {
        self.branch.as_deref().unwrap_or(DEFAULT_BRANCH)
    }
}

/// A built PDF and what it was built from.
#[derive(Debug, Clone)]
pub struct CompileResult {
    pub pdf: Vec<u8>,
    /// Repository-relative inputs; sent back as `X-Dependencies`.
    pub dependencies: Vec<String>,
    pub log: String,
    pub attempts: u32,
    /// Whether the build ran in the persistent tree.
    pub persistent: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearCacheRequest {
    #[serde(default)]
    pub paper_id: Option<String>,
    #[serde(default)]
    pub paper_ids: Option<Vec<String>>,
}

impl ClearCacheRequest {
    /// Every id named by either field, in request order.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.paper_id.iter().cloned().collect();
        ids.extend(self.paper_ids.iter().flatten().cloned());
        ids.dedup();
        ids
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ClearCacheResponse {
    pub deleted: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefsRequest {
    pub git_url: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub auth: Option<GitAuth>,
    #[serde(default)]
    pub known_sha: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeRequest {
    pub git_url: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub auth: Option<GitAuth>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TreeResponse {
    pub files: Vec<crate::git::TreeEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRequest {
    pub git_url: String,
    pub file_path: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub auth: Option<GitAuth>,
}

/// Serves both the full and the selective archive endpoints; the full one
/// ignores the filters.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveRequest {
    pub git_url: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub auth: Option<GitAuth>,
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
}

/// Either `filePath` or `filePaths` must be set.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashRequest {
    pub git_url: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub auth: Option<GitAuth>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub file_paths: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileHash {
    pub file_path: String,
    /// `None` when the path does not exist on the branch.
    pub sha: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum HashResponse {
    Single(FileHash),
    Batch { hashes: Vec<FileHash> },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailRequest {
    pub pdf_base64: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub format: Option<String>,
}

/// Rendered thumbnail plus its content type.
#[derive(Debug, Clone)]
pub struct Thumbnail {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct HealthChecks {
    pub latexmk: bool,
    pub git: bool,
    pub pdftoppm: bool,
}

impl HealthChecks {
    pub fn all_ok(&self) -> bool {
        self.latexmk && self.git && self.pdftoppm
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// `"ok"` or `"degraded"`.
    pub status: &'static str,
    pub checks: HealthChecks,
    pub queue: QueueStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_free_bytes: Option<u64>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.checks.all_ok()
    }
}

/// Result of removing leftovers from crashed instances.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub job_dirs: usize,
    pub staging_dirs: usize,
}
