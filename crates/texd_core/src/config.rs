//! Service configuration.

use crate::cache::CacheMode;
use crate::error::{Result, TexdError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete configuration for the compile service.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Root directories.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Compiled-artifact cache.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Persistent working-tree cache.
    #[serde(default)]
    pub persist: PersistConfig,

    /// Persistent-repo lock behaviour.
    #[serde(default)]
    pub lock: LockConfig,

    /// Compilation queue bounds.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Subprocess timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Hard caps on request/response sizes.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// HTTP listener and access control.
    #[serde(default)]
    pub server: ServerConfig,

    /// Git remote policy.
    #[serde(default)]
    pub git: GitConfig,
}

impl Config {
    /// Load configuration from a TOML file, or defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)
                .map_err(|e| TexdError::ConfigError(format!("failed to read config: {}", e)))?;
            toml::from_str(&content)
                .map_err(|e| TexdError::ConfigError(format!("failed to parse config: {}", e)))
        } else {
            Ok(Config::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| TexdError::ConfigError(format!("failed to serialize config: {}", e)))?;
        fs::write(path, content)
            .map_err(|e| TexdError::ConfigError(format!("failed to write config: {}", e)))?;
        Ok(())
    }

    /// Checks cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.queue.capacity == 0 {
            return Err(TexdError::ConfigError(
                "queue.capacity must be at least 1".into(),
            ));
        }
        if self.lock.stale_secs == 0 {
            return Err(TexdError::ConfigError(
                "lock.stale_secs must be at least 1".into(),
            ));
        }
        let roots = [
            &self.paths.work_root,
            &self.paths.cache_root,
            &self.paths.persist_root,
        ];
        for (i, a) in roots.iter().enumerate() {
            for b in roots.iter().skip(i + 1) {
                if a == b {
                    return Err(TexdError::ConfigError(format!(
                        "work, cache and persist roots must differ ({} is reused)",
                        a.display()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Root directories for job scratch space and both cache layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Per-job scratch directories live here.
    pub work_root: PathBuf,
    /// Compiled-artifact cache entries.
    pub cache_root: PathBuf,
    /// Persistent working trees.
    pub persist_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let base = std::env::temp_dir().join("texd");
        Self {
            work_root: base.join("jobs"),
            cache_root: base.join("cache"),
            persist_root: base.join("repos"),
        }
    }
}

/// Compiled-artifact cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Operator-level allow flag. Requests can only opt in when this is `aux`.
    pub mode: CacheMode,
    /// Entries unused for longer than this are evicted (default: 72).
    pub ttl_hours: u64,
    /// Total size cap in megabytes (default: 2048).
    pub max_mb: u64,
    /// Seconds between background eviction passes (default: 3600).
    pub eviction_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mode: CacheMode::Off,
            ttl_hours: 72,
            max_mb: 2048,
            eviction_interval_secs: 60 * 60,
        }
    }
}

impl CacheConfig {
    /// Returns the TTL as a Duration.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_hours * 60 * 60)
    }

    /// Returns the size cap in bytes.
    pub fn max_bytes(&self) -> u64 {
        self.max_mb * 1024 * 1024
    }

    /// Returns the eviction interval as a Duration.
    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }
}

/// Persistent working-tree cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistConfig {
    /// Allow reuse of working trees across builds of the same paper.
    pub enabled: bool,
    /// Entries unused for longer than this are evicted (default: 168).
    pub ttl_hours: u64,
    /// Total size cap in megabytes (default: 8192).
    pub max_mb: u64,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_hours: 7 * 24,
            max_mb: 8192,
        }
    }
}

impl PersistConfig {
    /// Returns the TTL as a Duration.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_hours * 60 * 60)
    }

    /// Returns the size cap in bytes.
    pub fn max_bytes(&self) -> u64 {
        self.max_mb * 1024 * 1024
    }
}

/// Advisory lock timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// A lock older than this is considered abandoned (default: 900).
    pub stale_secs: u64,
    /// How long a request waits for a held lock (default: 120).
    pub wait_secs: u64,
    /// Poll interval while waiting, in milliseconds (default: 500).
    pub poll_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_secs: 15 * 60,
            wait_secs: 120,
            poll_ms: 500,
        }
    }
}

impl LockConfig {
    /// Returns the stale threshold as a Duration.
    pub fn stale(&self) -> Duration {
        Duration::from_secs(self.stale_secs)
    }

    /// Returns the wait timeout as a Duration.
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    /// Returns the poll interval as a Duration.
    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }
}

/// Compilation queue bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Jobs allowed to run at once (default: 2).
    pub capacity: usize,
    /// Jobs allowed to wait for a slot (default: 10).
    pub max_depth: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 2,
            max_depth: 10,
        }
    }
}

/// Subprocess timeouts in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub clone_secs: u64,
    pub fetch_secs: u64,
    pub compile_secs: u64,
    pub git_quick_secs: u64,
    pub probe_secs: u64,
    pub thumbnail_secs: u64,
    /// Bounded wait for in-flight requests on shutdown.
    pub drain_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            clone_secs: 120,
            fetch_secs: 180,
            compile_secs: 300,
            git_quick_secs: 30,
            probe_secs: 10,
            thumbnail_secs: 30,
            drain_secs: 30,
        }
    }
}

impl TimeoutConfig {
    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_secs)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_secs)
    }

    pub fn git_quick_timeout(&self) -> Duration {
        Duration::from_secs(self.git_quick_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_secs)
    }

    pub fn thumbnail_timeout(&self) -> Duration {
        Duration::from_secs(self.thumbnail_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_secs)
    }
}

/// Hard caps on archive responses and request bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum files in one archive response (default: 2000).
    pub max_archive_files: usize,
    /// Maximum total bytes in one archive response (default: 50 MiB).
    pub max_archive_bytes: u64,
    /// Maximum decoded PDF size accepted for thumbnails (default: 50 MiB).
    pub max_thumbnail_pdf_bytes: usize,
    /// Maximum entries accepted in `knownDependencies` (default: 5000).
    pub max_known_dependencies: usize,
    /// Maximum files hashed in one batch request (default: 500).
    pub max_hash_batch: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_archive_files: 2000,
            max_archive_bytes: 50 * 1024 * 1024,
            max_thumbnail_pdf_bytes: 50 * 1024 * 1024,
            max_known_dependencies: 5000,
            max_hash_batch: 500,
        }
    }
}

/// HTTP listener and access control.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0).
    pub bind: String,
    /// Listen port (default: 3001).
    pub port: u16,
    /// Static API key; `None` disables auth.
    pub api_key: Option<String>,
    /// Origins allowed by CORS; empty disables CORS headers.
    pub allowed_origins: Vec<String>,
    /// Requests per client IP per minute (default: 120).
    pub rate_limit_per_min: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3001,
            api_key: None,
            allowed_origins: Vec::new(),
            rate_limit_per_min: 120,
        }
    }
}

/// Git remote policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitConfig {
    /// Accept `file://` remotes. Intended for self-hosted mirrors and tests.
    pub allow_file_urls: bool,
}
