//! File dumps of a checked-out repository.

use crate::error::{Result, TexdError};
use crate::paths::{normalize_relative, safe_existing_path, to_slash};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Encoding {
    #[serde(rename = "utf-8")]
    Utf8,
    #[serde(rename = "base64")]
    Base64,
}

/// File content as sent over JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileContent {
    pub content: String,
    pub encoding: Encoding,
}

/// Text stays text; anything that is not NUL-free UTF-8 becomes base64.
pub fn encode_content(bytes: &[u8]) -> FileContent {
    match std::str::from_utf8(bytes) {
        Ok(text) if !text.contains('\0') => FileContent {
            content: text.to_string(),
            encoding: Encoding::Utf8,
        },
        _ => FileContent {
            content: STANDARD.encode(bytes),
            encoding: Encoding::Base64,
        },
    }
}

/// Reads one file from a checkout, refusing symlinks and escapes.
pub fn read_file(root: &Path, rel: &str, max_bytes: u64) -> Result<FileContent> {
    let path = safe_existing_path(root, rel)
        .filter(|p| p.is_file())
        .ok_or_else(|| TexdError::NotFound(format!("file '{}'", rel)))?;
    let len = fs::metadata(&path)?.len();
    if len > max_bytes {
        return Err(TexdError::PayloadTooLarge {
            what: "bytes",
            limit: max_bytes,
        });
    }
    Ok(encode_content(&fs::read(&path)?))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: String,
    #[serde(flatten)]
    pub file: FileContent,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Archive {
    pub files: Vec<ArchiveEntry>,
    pub total_bytes: u64,
}

/// Which files to include. Empty filters include everything.
#[derive(Debug, Clone, Default)]
pub struct ArchiveFilter {
    /// Lowercase extensions without the dot.
    pub extensions: Vec<String>,
    /// Repository-relative files or directories.
    pub paths: Vec<String>,
}

impl ArchiveFilter {
    pub fn new(extensions: &[String], paths: &[String]) -> Result<Self> {
        let extensions = extensions
            .iter()
            .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        let paths = paths
            .iter()
            .map(|p| {
                normalize_relative(p)
                    .map(|n| to_slash(&n))
                    .ok_or_else(|| TexdError::invalid(format!("invalid path '{}'", p)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { extensions, paths })
    }

    fn matches(&self, rel: &str) -> bool {
        let ext_ok = self.extensions.is_empty()
            || Path::new(rel)
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase())
                .is_some_and(|e| self.extensions.contains(&e));
        let path_ok = self.paths.is_empty()
            || self
                .paths
                .iter()
                .any(|p| rel == p || rel.starts_with(&format!("{}/", p)));
        ext_ok && path_ok
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ArchiveLimits {
    pub max_files: usize,
    pub max_bytes: u64,
}

/// Collects matching files under `root`, skipping `.git/` and symlinks.
///
/// Fails with [`TexdError::PayloadTooLarge`] as soon as either limit is
/// exceeded.
pub fn collect(root: &Path, filter: &ArchiveFilter, limits: ArchiveLimits) -> Result<Archive> {
    let mut archive = Archive::default();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !(e.file_type().is_dir() && e.file_name() == ".git"));

    for entry in walker {
        let entry = entry.map_err(|e| std::io::Error::other(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let rel = to_slash(rel);
        if !filter.matches(&rel) {
            continue;
        }

        let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if archive.files.len() + 1 > limits.max_files {
            return Err(TexdError::PayloadTooLarge {
                what: "files",
                limit: limits.max_files as u64,
            });
        }
        if archive.total_bytes + len > limits.max_bytes {
            return Err(TexdError::PayloadTooLarge {
                what: "bytes",
                limit: limits.max_bytes,
            });
        }

        let bytes = fs::read(entry.path())?;
        archive.total_bytes += bytes.len() as u64;
        archive.files.push(ArchiveEntry {
            path: rel,
            file: encode_content(&bytes),
        });
    }
    Ok(archive)
}
