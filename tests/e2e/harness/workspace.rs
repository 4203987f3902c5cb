use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use texd_core::{CompileService, Config, Toolchain};

/// Isolated work, cache and persist roots plus a config pointing at them.
pub struct TestWorkspace {
    dir: TempDir,
    pub config: Config,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let dir = TempDir::new().context("Failed to create temp directory")?;
        let mut config = Config::default();
        config.paths.work_root = dir.path().join("jobs");
        config.paths.cache_root = dir.path().join("cache");
        config.paths.persist_root = dir.path().join("repos");
        config.git.allow_file_urls = true;
        config.timeouts.clone_secs = 30;
        config.timeouts.fetch_secs = 30;
        config.timeouts.compile_secs = 30;
        config.lock.wait_secs = 5;
        config.lock.poll_ms = 20;
        Ok(Self { dir, config })
    }

    /// Applies `f` to the config before any service is built.
    pub fn configure(mut self, f: impl FnOnce(&mut Config)) -> Self {
        f(&mut self.config);
        self
    }

    /// Enables the artifact cache for requests that ask for it.
    pub fn with_artifact_cache(self) -> Self {
        self.configure(|c| c.cache.mode = texd_core::CacheMode::Aux)
    }

    /// Enables persistent working trees (and the artifact cache they key on).
    pub fn with_persistence(self) -> Self {
        self.with_artifact_cache()
            .configure(|c| c.persist.enabled = true)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn work_root(&self) -> PathBuf {
        self.config.paths.work_root.clone()
    }

    pub fn service(&self, toolchain: Arc<dyn Toolchain>) -> Result<CompileService> {
        Ok(CompileService::with_toolchain(self.config.clone(), toolchain)?)
    }

    /// A second service over the same roots with a tweaked config, as a
    /// restarted or differently configured process would see them.
    pub fn service_with(
        &self,
        toolchain: Arc<dyn Toolchain>,
        f: impl FnOnce(&mut Config),
    ) -> Result<CompileService> {
        let mut config = self.config.clone();
        f(&mut config);
        Ok(CompileService::with_toolchain(config, toolchain)?)
    }

    /// Job directories still present under the work root.
    pub fn leftover_jobs(&self) -> usize {
        fs::read_dir(self.work_root())
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.path().is_dir())
                    .count()
            })
            .unwrap_or(0)
    }
}
