//! Path safety and request input validation.
//!
//! Every user-supplied path is resolved lexically against a root before it
//! touches the filesystem. Paths that are absolute, contain NUL bytes, or
//! would climb above the root are rejected outright rather than clamped.

use crate::error::{Result, TexdError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

pub const MAX_GIT_URL_LEN: usize = 2048;
pub const MAX_TARGET_LEN: usize = 1024;
pub const MAX_FILE_PATH_LEN: usize = 4096;
pub const MIN_THUMBNAIL_WIDTH: u32 = 16;
pub const MAX_THUMBNAIL_WIDTH: u32 = 2048;
pub const DEFAULT_THUMBNAIL_WIDTH: u32 = 400;

const LATEX_SOURCE_EXTENSIONS: &[&str] = &["tex", "ltx", "latex"];

/// Resolves `user_path` inside `root`.
///
/// Returns `None` for absolute paths, NUL bytes, empty input, and any
/// `..` sequence that would leave `root`. The check is lexical; callers that
/// read from disk must additionally refuse symbolic links (see
/// [`safe_existing_path`]).
pub fn safe_path(root: &Path, user_path: &str) -> Option<PathBuf> {
    normalize_relative(user_path).map(|rel| root.join(rel))
}

/// Normalizes a relative path, collapsing `.` and in-bounds `..` segments.
///
/// Backslashes are treated as separators so Windows-style input cannot
/// smuggle a `..` past the check.
pub fn normalize_relative(user_path: &str) -> Option<PathBuf> {
    if user_path.is_empty() || user_path.contains('\0') {
        return None;
    }
    let unified = user_path.replace('\\', "/");
    if unified.starts_with('/') || has_drive_prefix(&unified) {
        return None;
    }

    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(&unified).components() {
        match component {
            Component::Normal(seg) => parts.push(seg.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.iter().collect())
}

fn has_drive_prefix(p: &str) -> bool {
    let bytes = p.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Like [`safe_path`], but also requires the file to exist and refuses any
/// symbolic link between `root` and the final component.
pub fn safe_existing_path(root: &Path, user_path: &str) -> Option<PathBuf> {
    let rel = normalize_relative(user_path)?;
    let mut current = root.to_path_buf();
    for component in rel.components() {
        current.push(component);
        let meta = std::fs::symlink_metadata(&current).ok()?;
        if meta.file_type().is_symlink() {
            return None;
        }
    }
    Some(current)
}

/// Converts a path to a forward-slash relative string.
pub fn to_slash(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// LaTeX engine selected by the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compiler {
    Pdflatex,
    Xelatex,
    Lualatex,
}

impl Compiler {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdflatex => "pdflatex",
            Self::Xelatex => "xelatex",
            Self::Lualatex => "lualatex",
        }
    }

    /// The latexmk flag selecting this engine.
    pub fn latexmk_flag(&self) -> &'static str {
        match self {
            Self::Pdflatex => "-pdf",
            Self::Xelatex => "-pdfxe",
            Self::Lualatex => "-pdflua",
        }
    }
}

impl fmt::Display for Compiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compiler {
    type Err = TexdError;

    fn from_str(s: &str) -> Result<Self> {
        validate_compiler(s)
    }
}

/// Image format for thumbnails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
        }
    }
}

/// Accepts `https://`, `http://`, `ssh://` and scp-style `git@host:path` URLs.
pub fn validate_git_url(url: &str) -> Result<()> {
    validate_git_url_with(url, false)
}

/// [`validate_git_url`], optionally also accepting `file://` URLs. Local
/// URLs are only enabled by operators (and tests), never per request.
pub fn validate_git_url_with(url: &str, allow_file: bool) -> Result<()> {
    if url.is_empty() {
        return Err(TexdError::invalid("gitUrl is required"));
    }
    if url.len() > MAX_GIT_URL_LEN {
        return Err(TexdError::invalid(format!(
            "gitUrl exceeds {} characters",
            MAX_GIT_URL_LEN
        )));
    }
    if url.starts_with('-') {
        return Err(TexdError::invalid("gitUrl must not start with '-'"));
    }
    if url.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(TexdError::invalid(
            "gitUrl must not contain whitespace or control characters",
        ));
    }

    if let Some(path) = url.strip_prefix("file://") {
        if allow_file && path.starts_with('/') {
            return Ok(());
        }
        return Err(TexdError::invalid("file:// gitUrls are not accepted"));
    }

    let host_and_path = if let Some(rest) = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .or_else(|| url.strip_prefix("ssh://"))
    {
        rest
    } else if let Some(rest) = url.strip_prefix("git@") {
        match rest.split_once(':') {
            Some((host, path)) if !host.is_empty() && !path.is_empty() => rest,
            _ => return Err(TexdError::invalid("malformed scp-style gitUrl")),
        }
    } else {
        return Err(TexdError::invalid(
            "gitUrl must use https://, http://, ssh:// or git@host:path",
        ));
    };

    let host = host_and_path
        .split(['/', ':'])
        .next()
        .unwrap_or_default();
    let host = host.rsplit('@').next().unwrap_or_default();
    if host.is_empty() {
        return Err(TexdError::invalid("gitUrl has no host"));
    }
    Ok(())
}

/// Only the three engines latexmk drives are allowed.
pub fn validate_compiler(name: &str) -> Result<Compiler> {
    match name {
        "pdflatex" => Ok(Compiler::Pdflatex),
        "xelatex" => Ok(Compiler::Xelatex),
        "lualatex" => Ok(Compiler::Lualatex),
        other => Err(TexdError::invalid(format!(
            "unsupported compiler '{}' (expected pdflatex, xelatex or lualatex)",
            other
        ))),
    }
}

/// The target must stay inside `root` and name a LaTeX source file.
///
/// Returns the normalized forward-slash relative path.
pub fn validate_target(root: &Path, target: &str) -> Result<String> {
    if target.len() > MAX_TARGET_LEN {
        return Err(TexdError::invalid(format!(
            "target exceeds {} characters",
            MAX_TARGET_LEN
        )));
    }
    let rel = normalize_relative(target)
        .ok_or_else(|| TexdError::invalid("target must be a relative path inside the repository"))?;
    let ext = rel
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext {
        Some(e) if LATEX_SOURCE_EXTENSIONS.contains(&e.as_str()) => {}
        _ => {
            return Err(TexdError::invalid(
                "target must end in .tex, .ltx or .latex",
            ))
        }
    }
    if safe_path(root, target).is_none() {
        return Err(TexdError::invalid("target escapes the repository root"));
    }
    Ok(to_slash(&rel))
}

/// Generic repository-relative file path (used by file, tree and hash requests).
pub fn validate_file_path(path: &str) -> Result<String> {
    if path.len() > MAX_FILE_PATH_LEN {
        return Err(TexdError::invalid(format!(
            "path exceeds {} characters",
            MAX_FILE_PATH_LEN
        )));
    }
    normalize_relative(path)
        .map(|p| to_slash(&p))
        .ok_or_else(|| TexdError::invalid("path must be a relative path inside the repository"))
}

/// Validated thumbnail parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThumbnailOptions {
    pub width: u32,
    pub format: ImageFormat,
}

pub fn validate_thumbnail_options(
    width: Option<u32>,
    format: Option<&str>,
) -> Result<ThumbnailOptions> {
    let width = width.unwrap_or(DEFAULT_THUMBNAIL_WIDTH);
    if !(MIN_THUMBNAIL_WIDTH..=MAX_THUMBNAIL_WIDTH).contains(&width) {
        return Err(TexdError::invalid(format!(
            "width must be between {} and {}",
            MIN_THUMBNAIL_WIDTH, MAX_THUMBNAIL_WIDTH
        )));
    }
    let format = match format.map(|f| f.to_ascii_lowercase()).as_deref() {
        None | Some("png") => ImageFormat::Png,
        Some("jpeg") | Some("jpg") => ImageFormat::Jpeg,
        Some(other) => {
            return Err(TexdError::invalid(format!(
                "unsupported thumbnail format '{}'",
                other
            )))
        }
    };
    Ok(ThumbnailOptions { width, format })
}

/// Branch names go on the git command line, so they get the same treatment.
pub fn validate_branch(branch: &str) -> Result<()> {
    if branch.is_empty() || branch.len() > 255 {
        return Err(TexdError::invalid("branch must be 1-255 characters"));
    }
    if branch.starts_with('-')
        || branch.contains("..")
        || branch
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c))
    {
        return Err(TexdError::invalid(format!("invalid branch name '{}'", branch)));
    }
    Ok(())
}
