//! texd core library
//!
//! Compiles LaTeX projects straight from git remotes, providing:
//! - Shallow and sparse clones with a one-shot sparse-checkout repair
//! - A compiled-artifact cache and long-lived per-paper working trees
//! - Advisory file locks with stale-lock reclamation
//! - Dependency extraction from latexmk's recorder output
//! - A bounded compile queue
//!
//! # Quick Start
//!
//! ```
//! use texd_core::paths::{safe_path, validate_compiler, Compiler};
//! use std::path::Path;
//!
//! let root = Path::new("/work/repo");
//! assert_eq!(safe_path(root, "chapters/intro.tex"), Some(root.join("chapters/intro.tex")));
//! assert_eq!(safe_path(root, "../etc/passwd"), None);
//! assert_eq!(validate_compiler("xelatex").unwrap(), Compiler::Xelatex);
//! ```
//!
//! # Cache modes
//!
//! Caching needs the operator, the request and a paper id to agree:
//!
//! ```
//! use texd_core::{resolve_cache_mode, CacheMode};
//!
//! assert_eq!(resolve_cache_mode(CacheMode::Aux, Some("p1"), Some(CacheMode::Aux)), CacheMode::Aux);
//! assert_eq!(resolve_cache_mode(CacheMode::Aux, None, Some(CacheMode::Aux)), CacheMode::Off);
//! assert_eq!(resolve_cache_mode(CacheMode::Off, Some("p1"), Some(CacheMode::Aux)), CacheMode::Off);
//! ```
//!
//! Everything the HTTP server exposes goes through [`CompileService`].

pub mod api;
pub mod archive;
pub mod cache;
pub mod compile;
pub mod config;
pub mod deps;
mod error;
pub mod evict;
pub mod fsutil;
pub mod git;
pub mod lock;
pub mod paths;
pub mod persist;
pub mod process;
pub mod progress;
pub mod queue;
pub mod refs;
pub mod service;
pub mod thumbnail;
pub mod workdir;

pub use cache::{resolve_cache_mode, ArtifactCache, CacheMode};
pub use compile::{compile_with_repair, CompileJob, CompileOutcome, SystemToolchain, Toolchain};
pub use config::Config;
pub use error::{ErrorKind, Result, TexdError};
pub use evict::{evict, EvictionConfig, EvictionReport};
pub use lock::{LockOptions, RepoLock};
pub use persist::PersistentRepoCache;
pub use queue::{CompileQueue, QueueStats};
pub use service::CompileService;

/// Milliseconds since the unix epoch; the timestamp format of every
/// metadata and lock file.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
