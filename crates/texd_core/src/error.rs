//! Error types for texd_core operations.

use std::path::PathBuf;
use thiserror::Error;

/// Core error type for texd_core operations.
#[derive(Error, Debug)]
pub enum TexdError {
    /// Request input failed validation (bad URL, compiler, path, option).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A requested target or file does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// latexmk ran but did not produce a PDF.
    #[error("compilation failed")]
    CompileFailed {
        /// Combined compiler output, tail-truncated.
        log: String,
        /// Whether the compiler was killed by its timeout.
        timed_out: bool,
    },

    /// A git invocation failed or timed out.
    #[error("git {operation} failed: {message}")]
    Git {
        /// Short name of the git operation (clone, fetch, ls-remote, ...)
        operation: &'static str,
        /// Captured stderr or timeout description
        message: String,
        /// Whether the invocation hit its timeout.
        timed_out: bool,
    },

    /// The compilation queue has no free slot and no room to wait.
    #[error("compilation queue is full ({running} running, {queued} queued)")]
    QueueFull {
        /// Jobs currently executing
        running: usize,
        /// Jobs waiting for a slot
        queued: usize,
    },

    /// The service is draining and no longer admits work.
    #[error("server is shutting down")]
    ShuttingDown,

    /// Waited too long for a persistent-repo lock.
    #[error("timed out waiting for lock at {}", path.display())]
    LockTimeout {
        /// Path to the contended lock file
        path: PathBuf,
    },

    /// Response would exceed a hard size or count cap.
    #[error("payload too large: {what} exceeds limit of {limit}")]
    PayloadTooLarge {
        /// What was being counted (bytes, files)
        what: &'static str,
        /// The configured limit
        limit: u64,
    },

    /// An external tool failed in a way that is not a compile failure.
    #[error("{tool} failed: {message}")]
    ToolFailed {
        /// Binary name
        tool: &'static str,
        /// Captured stderr or timeout description
        message: String,
    },

    /// Configuration error (loading, parsing, invalid values).
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Metadata (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of errors, mirroring how callers react to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or unsafe input. Never retried.
    Validation,
    /// Target or file missing.
    NotFound,
    /// git or latexmk failed; diagnostic log attached where available.
    ToolFailure,
    /// Queue full or payload too large. Safe to retry (queue) or shrink (payload).
    ResourceExhausted,
    /// Disk, lock, or serialization trouble.
    Infrastructure,
    /// Deliberate rejection while draining.
    ShuttingDown,
}

impl TexdError {
    /// Shorthand for building an [`TexdError::InvalidInput`].
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::CompileFailed { .. } | Self::Git { .. } | Self::ToolFailed { .. } => {
                ErrorKind::ToolFailure
            }
            Self::QueueFull { .. } | Self::PayloadTooLarge { .. } => ErrorKind::ResourceExhausted,
            Self::ShuttingDown => ErrorKind::ShuttingDown,
            Self::LockTimeout { .. }
            | Self::ConfigError(_)
            | Self::Serialization(_)
            | Self::Io(_) => ErrorKind::Infrastructure,
        }
    }

    /// Returns true if the error came from a subprocess timeout.
    pub fn timed_out(&self) -> bool {
        match self {
            Self::CompileFailed { timed_out, .. } | Self::Git { timed_out, .. } => *timed_out,
            _ => false,
        }
    }

    /// Returns a user-friendly recovery suggestion for the error, if available.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Self::QueueFull { .. } => Some("The server is busy. Retry after a few seconds."),
            Self::ShuttingDown => Some("The server is restarting. Retry shortly."),
            Self::LockTimeout { .. } => Some(
                "Another build of this paper is still running. Retry later, or remove the \
                 .lock file in the persistent repo directory if no build is active.",
            ),
            Self::CompileFailed { timed_out: true, .. } => {
                Some("Compilation exceeded the time limit. Simplify the document or split it.")
            }
            Self::Git {
                operation: "clone", ..
            } => Some("Check that the repository URL, branch and credentials are correct."),
            Self::PayloadTooLarge { .. } => {
                Some("Narrow the request with `paths` or `extensions`.")
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for TexdError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Convenience Result type for texd_core operations.
pub type Result<T> = std::result::Result<T, TexdError>;
