//! Command-line and environment overrides for [`Config`].

use clap::builder::BoolishValueParser;
use clap::Args;
use std::path::PathBuf;
use texd_core::{CacheMode, Config};

/// Every field is optional; only values that were actually given replace
/// what the config file (or the defaults) say.
#[derive(Debug, Default, Args)]
pub struct ConfigArgs {
    /// Listen port
    #[arg(long, global = true, env = "PORT")]
    pub port: Option<u16>,

    /// Listen address
    #[arg(long, global = true, env = "TEXD_BIND")]
    pub bind: Option<String>,

    /// Root for per-job scratch directories
    #[arg(long, global = true, env = "TEXD_WORK_ROOT")]
    pub work_root: Option<PathBuf>,

    /// Root for the compiled-artifact cache
    #[arg(long, global = true, env = "TEXD_CACHE_ROOT")]
    pub cache_root: Option<PathBuf>,

    /// Root for persistent working trees
    #[arg(long, global = true, env = "TEXD_PERSIST_ROOT")]
    pub persist_root: Option<PathBuf>,

    /// Operator cache flag (off, aux)
    #[arg(long, global = true, env = "TEXD_CACHE_MODE")]
    pub cache_mode: Option<CacheMode>,

    #[arg(long, global = true, env = "TEXD_CACHE_TTL_HOURS")]
    pub cache_ttl_hours: Option<u64>,

    #[arg(long, global = true, env = "TEXD_CACHE_MAX_MB")]
    pub cache_max_mb: Option<u64>,

    /// Allow persistent working trees (1/0, true/false)
    #[arg(long, global = true, env = "TEXD_PERSIST", value_parser = BoolishValueParser::new())]
    pub persist: Option<bool>,

    #[arg(long, global = true, env = "TEXD_PERSIST_TTL_HOURS")]
    pub persist_ttl_hours: Option<u64>,

    #[arg(long, global = true, env = "TEXD_PERSIST_MAX_MB")]
    pub persist_max_mb: Option<u64>,

    /// Seconds after which a lock is considered abandoned
    #[arg(long, global = true, env = "TEXD_LOCK_STALE_SECS")]
    pub lock_stale_secs: Option<u64>,

    /// Seconds a build waits for a held lock
    #[arg(long, global = true, env = "TEXD_LOCK_WAIT_SECS")]
    pub lock_wait_secs: Option<u64>,

    #[arg(long, global = true, env = "TEXD_QUEUE_CAPACITY")]
    pub queue_capacity: Option<usize>,

    #[arg(long, global = true, env = "TEXD_QUEUE_DEPTH")]
    pub queue_depth: Option<usize>,

    /// Comma separated CORS origins
    #[arg(long, global = true, env = "TEXD_ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Option<Vec<String>>,

    /// Static API key; unset disables auth
    #[arg(long, global = true, env = "TEXD_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(long, global = true, env = "TEXD_RATE_LIMIT_PER_MIN")]
    pub rate_limit_per_min: Option<u32>,

    /// Accept file:// remotes
    #[arg(long, global = true, env = "TEXD_ALLOW_FILE_URLS", value_parser = BoolishValueParser::new())]
    pub allow_file_urls: Option<bool>,
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

impl ConfigArgs {
    pub fn apply(self, config: &mut Config) {
        set(&mut config.server.port, self.port);
        set(&mut config.server.bind, self.bind);
        set(&mut config.paths.work_root, self.work_root);
        set(&mut config.paths.cache_root, self.cache_root);
        set(&mut config.paths.persist_root, self.persist_root);
        set(&mut config.cache.mode, self.cache_mode);
        set(&mut config.cache.ttl_hours, self.cache_ttl_hours);
        set(&mut config.cache.max_mb, self.cache_max_mb);
        set(&mut config.persist.enabled, self.persist);
        set(&mut config.persist.ttl_hours, self.persist_ttl_hours);
        set(&mut config.persist.max_mb, self.persist_max_mb);
        set(&mut config.lock.stale_secs, self.lock_stale_secs);
        set(&mut config.lock.wait_secs, self.lock_wait_secs);
        set(&mut config.queue.capacity, self.queue_capacity);
        set(&mut config.queue.max_depth, self.queue_depth);
        set(&mut config.server.rate_limit_per_min, self.rate_limit_per_min);
        set(&mut config.git.allow_file_urls, self.allow_file_urls);
        if let Some(origins) = self.allowed_origins {
            config.server.allowed_origins = origins
                .into_iter()
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }
        if let Some(key) = self.api_key.filter(|k| !k.is_empty()) {
            config.server.api_key = Some(key);
        }
    }
}
