//! The compile service: every operation the HTTP layer exposes.
//!
//! [`CompileService`] owns both cache layers, the refs cache and the queue,
//! so tests can build as many independent instances as they like.

use crate::api::{
    ArchiveRequest, ClearCacheRequest, ClearCacheResponse, CompileRequest, CompileResult,
    FileHash, FileRequest, HashRequest, HashResponse, HealthChecks, HealthReport, RefsRequest,
    SweepReport, Thumbnail, ThumbnailRequest, TreeRequest, TreeResponse,
};
use crate::archive::{self, Archive, ArchiveFilter, ArchiveLimits, FileContent};
use crate::cache::{resolve_cache_mode, ArtifactCache, CacheMode};
use crate::compile::{self, CompileJob, SystemToolchain, Toolchain};
use crate::config::Config;
use crate::deps::{self, BuildLayout};
use crate::error::{Result, TexdError};
use crate::evict::{self, EvictionConfig, EvictionProgressCallback, EvictionReport};
use crate::fsutil;
use crate::git::{self, CloneSpec, GitAuth};
use crate::lock::LockOptions;
use crate::paths::{self, Compiler};
use crate::persist::{BuildKey, PersistMeta, PersistentRepoCache, Preparation};
use crate::progress::{
    HttpProgressSink, NoopSink, ProgressCallback, ProgressSink, ProgressTracker,
    PROGRESS_CHECKED_OUT, PROGRESS_DONE, PROGRESS_STARTED,
};
use crate::queue::CompileQueue;
use crate::refs::{GitRefSource, RefSource, RefsCache, RefsInfo};
use crate::thumbnail;
use crate::workdir::{self, JobDir};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Longest accepted `paperId`.
pub const MAX_PAPER_ID_LEN: usize = 256;

/// A validated compile request.
#[derive(Debug, Clone)]
struct CompilePlan {
    /// Remote URL with credentials injected. Never logged or persisted.
    url: String,
    /// Credential-free URL for logs and metadata.
    public_url: String,
    branch: String,
    target: String,
    compiler: Compiler,
    paper_id: Option<String>,
    mode: CacheMode,
    known_dependencies: Vec<String>,
    callback: Option<ProgressCallback>,
}

/// What a finished build leaves behind before it is turned into a response.
struct Built {
    pdf: Vec<u8>,
    dependencies: Vec<String>,
    log: String,
    attempts: u32,
}

pub struct CompileService {
    config: Config,
    artifacts: ArtifactCache,
    repos: PersistentRepoCache,
    refs: RefsCache,
    queue: CompileQueue,
    toolchain: Arc<dyn Toolchain>,
    ref_source: Arc<dyn RefSource>,
    http: reqwest::Client,
}

impl CompileService {
    /// Builds a service backed by the installed latexmk and git.
    pub fn new(config: Config) -> Result<Self> {
        let toolchain = Arc::new(SystemToolchain {
            git_timeout: config.timeouts.git_quick_timeout(),
        });
        Self::with_toolchain(config, toolchain)
    }

    pub fn with_toolchain(config: Config, toolchain: Arc<dyn Toolchain>) -> Result<Self> {
        let ref_source = Arc::new(GitRefSource {
            scratch_root: config.paths.work_root.clone(),
            timeout: config.timeouts.git_quick_timeout(),
        });
        Self::with_parts(config, toolchain, ref_source)
    }

    pub fn with_parts(
        config: Config,
        toolchain: Arc<dyn Toolchain>,
        ref_source: Arc<dyn RefSource>,
    ) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.paths.work_root)?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| TexdError::ConfigError(format!("http client: {}", e)))?;
        Ok(Self {
            artifacts: ArtifactCache::new(&config.paths.cache_root),
            repos: PersistentRepoCache::new(&config.paths.persist_root),
            refs: RefsCache::default(),
            queue: CompileQueue::new(config.queue.capacity, config.queue.max_depth),
            toolchain,
            ref_source,
            http,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn queue(&self) -> &CompileQueue {
        &self.queue
    }

    pub fn artifacts(&self) -> &ArtifactCache {
        &self.artifacts
    }

    pub fn repos(&self) -> &PersistentRepoCache {
        &self.repos
    }

    fn lock_options(&self) -> LockOptions {
        LockOptions::from(&self.config.lock)
    }

    fn check_url(&self, url: &str) -> Result<()> {
        paths::validate_git_url_with(url, self.config.git.allow_file_urls)
    }

    // ------------------------------------------------------------------
    // Compilation
    // ------------------------------------------------------------------

    /// Clones `req.git_url`, builds `req.target` and returns the PDF.
    ///
    /// Rejected immediately with [`TexdError::QueueFull`] when the queue has
    /// no room.
    pub async fn compile_from_git(&self, req: CompileRequest) -> Result<CompileResult> {
        let plan = self.plan(&req)?;
        let started = Instant::now();
        let out = self.queue.run(|| self.run_job(plan)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &out {
            Ok(r) => info!(elapsed_ms, bytes = r.pdf.len(), deps = r.dependencies.len(), "compile succeeded"),
            Err(e) => info!(elapsed_ms, error = %e, "compile failed"),
        }
        out
    }

    fn plan(&self, req: &CompileRequest) -> Result<CompilePlan> {
        self.check_url(&req.git_url)?;
        let branch = req.branch_or_default().to_string();
        paths::validate_branch(&branch)?;
        let compiler = paths::validate_compiler(&req.compiler)?;
        // Lexical check only; existence is checked after checkout.
        let target = paths::validate_target(Path::new("/"), &req.target)?;

        let paper_id = match req.paper_id.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(id) => {
                validate_paper_id(id)?;
                Some(id.to_string())
            }
        };

        let requested = req
            .cache_mode
            .as_deref()
            .map(str::parse::<CacheMode>)
            .transpose()?;
        let mode = resolve_cache_mode(self.config.cache.mode, paper_id.as_deref(), requested);

        let known = req.known_dependencies.as_deref().unwrap_or_default();
        if known.len() > self.config.limits.max_known_dependencies {
            return Err(TexdError::invalid(format!(
                "knownDependencies exceeds {} entries",
                self.config.limits.max_known_dependencies
            )));
        }
        let known_dependencies: BTreeSet<String> = known
            .iter()
            .filter_map(|p| match paths::validate_file_path(p) {
                Ok(p) => Some(p),
                Err(_) => {
                    debug!(path = %p, "ignoring invalid known dependency");
                    None
                }
            })
            .collect();

        if let Some(cb) = &req.progress_callback {
            cb.validate()?;
        }

        Ok(CompilePlan {
            url: git::authenticated_url(&req.git_url, req.auth.as_ref()),
            public_url: git::redact_url(&req.git_url),
            branch,
            target,
            compiler,
            paper_id,
            mode,
            known_dependencies: known_dependencies.into_iter().collect(),
            callback: req.progress_callback.clone(),
        })
    }

    async fn run_job(&self, plan: CompilePlan) -> Result<CompileResult> {
        let job = JobDir::create(&self.config.paths.work_root)?;
        let span = info_span!(
            "job",
            job_id = %job.id(),
            paper_id = plan.paper_id.as_deref().unwrap_or("-"),
            compiler = %plan.compiler,
            target = %plan.target,
        );

        async move {
            info!(url = %plan.public_url, branch = %plan.branch, cache_mode = %plan.mode, "job started");
            let sink: Arc<dyn ProgressSink> = match &plan.callback {
                Some(cb) => Arc::new(HttpProgressSink::new(self.http.clone(), cb)),
                None => Arc::new(NoopSink),
            };
            let tracker = Arc::new(ProgressTracker::new(sink, plan.paper_id.clone()));
            tracker.report(PROGRESS_STARTED);

            let persistent = self.config.persist.enabled && plan.mode == CacheMode::Aux;
            let (built, persistent) = match plan.paper_id.as_deref() {
                Some(paper_id) if persistent => {
                    match self.repos.lock(paper_id, self.lock_options()).await {
                        Ok(lock) => {
                            let out = self.build_persistent(&plan, paper_id, &job, &tracker).await;
                            self.scrub_persistent_remote(&plan, paper_id).await;
                            lock.release();
                            out?
                        }
                        Err(e @ TexdError::LockTimeout { .. }) => return Err(e),
                        Err(e) => {
                            warn!(error = %e, "persistent repo lock failed, building without persistence");
                            (self.build_ephemeral(&plan, &job, &tracker).await?, false)
                        }
                    }
                }
                _ => (self.build_ephemeral(&plan, &job, &tracker).await?, false),
            };

            tracker.report(PROGRESS_DONE);
            Ok(CompileResult {
                pdf: built.pdf,
                dependencies: built.dependencies,
                log: built.log,
                attempts: built.attempts,
                persistent,
            })
        }
        .instrument(span)
        .await
    }

    /// Leaves no token in the long-lived tree's git config. The next update
    /// sets an authenticated URL again for its own fetch.
    async fn scrub_persistent_remote(&self, plan: &CompilePlan, paper_id: &str) {
        if git::strip_credentials(&plan.url) == plan.url {
            return;
        }
        let repo = self.repos.entry_paths(paper_id).repo;
        if !repo.join(".git").exists() {
            return;
        }
        if let Err(e) =
            git::scrub_origin_credentials(&repo, self.config.timeouts.git_quick_timeout()).await
        {
            warn!(error = %e, "failed to remove credentials from persistent repo");
        }
    }

    /// Clones into `dir`, sparsely when `sparse` is given. A failed sparse
    /// clone falls back to a full one. Returns whether the result is sparse.
    async fn checkout(
        &self,
        plan: &CompilePlan,
        dir: &Path,
        sparse: Option<&[String]>,
    ) -> Result<bool> {
        let spec = CloneSpec {
            url: &plan.url,
            dir,
            branch: Some(&plan.branch),
            timeout: self.config.timeouts.clone_timeout(),
        };
        if let Some(paths) = sparse {
            match git::clone_repository_sparse(&spec, paths).await {
                Ok(()) => return Ok(true),
                Err(e) => warn!(error = %e, "sparse clone failed, falling back to full clone"),
            }
        }
        git::clone_repository(&spec).await?;
        Ok(false)
    }

    /// Sparse set for this build: known dependencies, else `previous`, plus
    /// the target. `None` means a full checkout.
    fn sparse_set(plan: &CompilePlan, previous: Option<&[String]>) -> Option<Vec<String>> {
        let mut set: BTreeSet<String> = previous.unwrap_or_default().iter().cloned().collect();
        if plan.known_dependencies.is_empty() && previous.is_none() {
            return None;
        }
        set.extend(plan.known_dependencies.iter().cloned());
        set.insert(plan.target.clone());
        Some(set.into_iter().collect())
    }

    async fn build_ephemeral(
        &self,
        plan: &CompilePlan,
        job: &JobDir,
        tracker: &Arc<ProgressTracker>,
    ) -> Result<Built> {
        let repo = job.path().join("repo");
        let aux = job.subdir("aux")?;
        let out = job.subdir("out")?;

        let sparse_paths = Self::sparse_set(plan, None);
        let sparse = self.checkout(plan, &repo, sparse_paths.as_deref()).await?;
        tracker.report(PROGRESS_CHECKED_OUT);
        ensure_target(&repo, &plan.target)?;

        let cached_paper = match (plan.mode, plan.paper_id.as_deref()) {
            (CacheMode::Aux, Some(id)) => Some(id),
            _ => None,
        };
        if let Some(paper_id) = cached_paper {
            self.artifacts
                .restore(paper_id, plan.compiler, &plan.target, &aux, &out);
        }

        let compile_job = CompileJob {
            repo_root: repo.clone(),
            target: plan.target.clone(),
            compiler: plan.compiler,
            aux_dir: aux.clone(),
            out_dir: out.clone(),
            timeout: self.config.timeouts.compile_timeout(),
        };
        let outcome =
            compile::compile_with_repair(self.toolchain.as_ref(), &compile_job, sparse, Some(tracker))
                .await?;

        let dependencies = deps::extract_dependencies(&BuildLayout {
            repo_root: &repo,
            target: &plan.target,
            aux_dir: &aux,
            out_dir: &out,
        });
        let pdf = fs::read(&outcome.pdf_path)?;

        if let Some(paper_id) = cached_paper {
            let job_id = job.id().to_string();
            if let Err(e) =
                self.artifacts
                    .persist(paper_id, plan.compiler, &plan.target, &job_id, &aux, &out)
            {
                warn!(error = %e, "failed to write artifact cache");
            }
        }

        Ok(Built {
            pdf,
            dependencies,
            log: outcome.log,
            attempts: outcome.attempts,
        })
    }

    /// Builds in the paper's long-lived tree. Caller holds the entry lock.
    ///
    /// Returns whether the persistent tree was actually used; bookkeeping
    /// failures fall back to a job-scoped build.
    async fn build_persistent(
        &self,
        plan: &CompilePlan,
        paper_id: &str,
        job: &JobDir,
        tracker: &Arc<ProgressTracker>,
    ) -> Result<(Built, bool)> {
        let entry = self.repos.entry_paths(paper_id);
        let key = BuildKey {
            git_url: &plan.public_url,
            branch: &plan.branch,
            target: &plan.target,
            compiler: plan.compiler,
        };
        let previous = self.repos.read_meta(paper_id);
        let prep = match self.repos.prepare(paper_id, &key) {
            Ok(prep) => prep,
            Err(e) => {
                warn!(error = %e, "persistent repo unusable, building without persistence");
                return Ok((self.build_ephemeral(plan, job, tracker).await?, false));
            }
        };
        debug!(preparation = ?prep, "persistent repo prepared");

        let previous_sparse = match prep {
            Preparation::Fresh | Preparation::Rebuilt => None,
            Preparation::OutputsCleared | Preparation::Reuse => {
                previous.and_then(|m| m.sparse_paths)
            }
        };
        let sparse_paths = Self::sparse_set(plan, previous_sparse.as_deref());

        let sparse = if prep.needs_clone() {
            self.checkout(plan, &entry.repo, sparse_paths.as_deref()).await?
        } else {
            let spec = CloneSpec {
                url: &plan.url,
                dir: &entry.repo,
                branch: Some(&plan.branch),
                timeout: self.config.timeouts.fetch_timeout(),
            };
            match git::update_repository(&spec, sparse_paths.as_deref()).await {
                Ok(update) => {
                    info!(changed = update.changed, head = %update.head, "persistent repo updated");
                    sparse_paths.is_some()
                }
                Err(e) => {
                    warn!(error = %e, "incremental update failed, recloning");
                    let reset = fsutil::remove_dir_if_exists(&entry.repo)
                        .and_then(|_| fsutil::empty_dir(&entry.aux))
                        .and_then(|()| fsutil::empty_dir(&entry.out));
                    if let Err(e) = reset {
                        warn!(error = %e, "persistent repo could not be reset, building without persistence");
                        return Ok((self.build_ephemeral(plan, job, tracker).await?, false));
                    }
                    self.checkout(plan, &entry.repo, sparse_paths.as_deref()).await?
                }
            }
        };
        tracker.report(PROGRESS_CHECKED_OUT);
        ensure_target(&entry.repo, &plan.target)?;

        let compile_job = CompileJob {
            repo_root: entry.repo.clone(),
            target: plan.target.clone(),
            compiler: plan.compiler,
            aux_dir: entry.aux.clone(),
            out_dir: entry.out.clone(),
            timeout: self.config.timeouts.compile_timeout(),
        };
        let result =
            compile::compile_with_repair(self.toolchain.as_ref(), &compile_job, sparse, Some(tracker))
                .await;

        // The tree now belongs to this request whether or not the build
        // succeeded; record that so the next request reconciles correctly.
        let mut recorded_sparse = sparse.then(|| git::read_sparse_paths(&entry.repo));
        if let (Some(recorded), Ok(outcome)) = (recorded_sparse.as_mut(), &result) {
            for p in &outcome.repaired {
                if !recorded.contains(p) {
                    recorded.push(p.clone());
                }
            }
        }
        let meta = PersistMeta {
            last_used: crate::now_millis(),
            git_url: plan.public_url.clone(),
            branch: plan.branch.clone(),
            paper_id: paper_id.to_string(),
            target: plan.target.clone(),
            compiler: plan.compiler,
            sparse_paths: recorded_sparse,
        };
        if let Err(e) = self.repos.write_meta(&meta) {
            warn!(error = %e, "failed to write persistent repo metadata");
        }

        let outcome = result?;
        let dependencies = deps::extract_dependencies(&BuildLayout {
            repo_root: &entry.repo,
            target: &plan.target,
            aux_dir: &entry.aux,
            out_dir: &entry.out,
        });
        let pdf = fs::read(&outcome.pdf_path)?;
        Ok((
            Built {
                pdf,
                dependencies,
                log: outcome.log,
                attempts: outcome.attempts,
            },
            true,
        ))
    }

    // ------------------------------------------------------------------
    // Cache maintenance
    // ------------------------------------------------------------------

    /// Removes both cache layers for every id in `req`. Returns how many
    /// papers had something to remove.
    pub async fn clear_caches(&self, req: &ClearCacheRequest) -> Result<ClearCacheResponse> {
        let ids = req.ids();
        if ids.is_empty() {
            return Err(TexdError::invalid("paperId or paperIds is required"));
        }
        for id in &ids {
            validate_paper_id(id)?;
        }

        let mut deleted = 0;
        for id in &ids {
            let artifacts = self.artifacts.clear_paper(id)?;
            let repo = self.repos.clear_paper(id, self.lock_options()).await?;
            if artifacts || repo {
                deleted += 1;
            }
            debug!(paper_id = %id, artifacts, repo, "cleared caches");
        }
        info!(requested = ids.len(), deleted, "cache clear");
        Ok(ClearCacheResponse { deleted })
    }

    /// One eviction pass over both layers, on a blocking thread.
    pub async fn run_eviction(
        &self,
        dry_run: bool,
        progress: Option<Arc<EvictionProgressCallback>>,
    ) -> Result<EvictionReport> {
        let mut config = EvictionConfig::from_config(&self.config);
        config.dry_run = dry_run;
        let artifacts = self.artifacts.clone();
        let repos = self.repos.clone();
        tokio::task::spawn_blocking(move || {
            evict::evict(&artifacts, &repos, &config, progress.as_deref())
        })
        .await
        .map_err(|e| TexdError::Io(std::io::Error::other(e.to_string())))?
    }

    /// Whether background eviction has anything to do.
    pub fn eviction_enabled(&self) -> bool {
        self.config.cache.mode == CacheMode::Aux || self.config.persist.enabled
    }

    /// Runs eviction once now and then every `eviction_interval` until
    /// `cancel` fires. Returns `None` when caching is off entirely.
    pub fn spawn_eviction_task(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.eviction_enabled() {
            debug!("caching disabled, not scheduling eviction");
            return None;
        }
        let service = Arc::clone(self);
        let period = self.config.cache.eviction_interval();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("eviction task stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        match service.run_eviction(false, None).await {
                            Ok(report) => debug!(
                                deleted = report.entries_deleted,
                                bytes_freed = report.bytes_freed,
                                "scheduled eviction finished"
                            ),
                            Err(e) => warn!(error = %e, "scheduled eviction failed"),
                        }
                    }
                }
            }
        }))
    }

    /// Removes leftover job directories and artifact staging directories.
    ///
    /// Only safe while no job is running.
    pub fn sweep(&self) -> Result<SweepReport> {
        let report = SweepReport {
            job_dirs: workdir::sweep(&self.config.paths.work_root)?,
            staging_dirs: self.artifacts.sweep_staging()?,
        };
        if report.job_dirs > 0 || report.staging_dirs > 0 {
            info!(job_dirs = report.job_dirs, staging_dirs = report.staging_dirs, "swept leftovers");
        }
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Repository inspection
    // ------------------------------------------------------------------

    pub async fn resolve_refs(&self, req: &RefsRequest) -> Result<RefsInfo> {
        self.check_url(&req.git_url)?;
        if let Some(b) = &req.branch {
            paths::validate_branch(b)?;
        }
        let url = git::authenticated_url(&req.git_url, req.auth.as_ref());
        self.refs
            .resolve(
                self.ref_source.as_ref(),
                &url,
                &git::redact_url(&req.git_url),
                req.branch.as_deref(),
                req.known_sha.as_deref(),
            )
            .await
    }

    /// Validates the common fields and makes a job directory to clone into.
    fn scratch_clone(
        &self,
        git_url: &str,
        branch: Option<&str>,
        auth: Option<&GitAuth>,
    ) -> Result<(JobDir, String)> {
        self.check_url(git_url)?;
        if let Some(b) = branch {
            paths::validate_branch(b)?;
        }
        let job = JobDir::create(&self.config.paths.work_root)?;
        Ok((job, git::authenticated_url(git_url, auth)))
    }

    pub async fn list_tree(&self, req: &TreeRequest) -> Result<TreeResponse> {
        let dir = match req.path.as_deref().map(str::trim) {
            None | Some("") | Some(".") | Some("/") => None,
            Some(p) => Some(paths::validate_file_path(p)?),
        };
        let (job, url) = self.scratch_clone(&req.git_url, req.branch.as_deref(), req.auth.as_ref())?;
        let repo = job.path().join("repo");
        git::clone_tree_only(&CloneSpec {
            url: &url,
            dir: &repo,
            branch: req.branch.as_deref(),
            timeout: self.config.timeouts.clone_timeout(),
        })
        .await?;
        let files =
            git::list_directory(&repo, dir.as_deref(), self.config.timeouts.git_quick_timeout())
                .await?;
        Ok(TreeResponse { files })
    }

    pub async fn read_file(&self, req: &FileRequest) -> Result<FileContent> {
        let file = paths::validate_file_path(&req.file_path)?;
        let (job, url) = self.scratch_clone(&req.git_url, req.branch.as_deref(), req.auth.as_ref())?;
        let repo = job.path().join("repo");
        git::clone_repository_sparse(
            &CloneSpec {
                url: &url,
                dir: &repo,
                branch: req.branch.as_deref(),
                timeout: self.config.timeouts.clone_timeout(),
            },
            std::slice::from_ref(&file),
        )
        .await?;
        archive::read_file(&repo, &file, self.config.limits.max_archive_bytes)
    }

    /// Every file on the branch. `extensions`/`paths` are ignored.
    pub async fn archive(&self, req: &ArchiveRequest) -> Result<Archive> {
        self.archive_with(req, ArchiveFilter::default()).await
    }

    /// Files matching `extensions` and `paths`.
    pub async fn selective_archive(&self, req: &ArchiveRequest) -> Result<Archive> {
        let filter = ArchiveFilter::new(&req.extensions, &req.paths)?;
        self.archive_with(req, filter).await
    }

    async fn archive_with(&self, req: &ArchiveRequest, filter: ArchiveFilter) -> Result<Archive> {
        let (job, url) = self.scratch_clone(&req.git_url, req.branch.as_deref(), req.auth.as_ref())?;
        let repo = job.path().join("repo");
        git::clone_repository(&CloneSpec {
            url: &url,
            dir: &repo,
            branch: req.branch.as_deref(),
            timeout: self.config.timeouts.clone_timeout(),
        })
        .await?;
        let limits = ArchiveLimits {
            max_files: self.config.limits.max_archive_files,
            max_bytes: self.config.limits.max_archive_bytes,
        };
        let archive = archive::collect(&repo, &filter, limits)?;
        debug!(files = archive.files.len(), bytes = archive.total_bytes, "archive collected");
        Ok(archive)
    }

    pub async fn file_hashes(&self, req: &HashRequest) -> Result<HashResponse> {
        let (requested, single) = match (&req.file_path, &req.file_paths) {
            (Some(p), None) => (vec![p.clone()], true),
            (None, Some(ps)) if !ps.is_empty() => (ps.clone(), false),
            _ => return Err(TexdError::invalid("exactly one of filePath or filePaths is required")),
        };
        if requested.len() > self.config.limits.max_hash_batch {
            return Err(TexdError::invalid(format!(
                "filePaths exceeds {} entries",
                self.config.limits.max_hash_batch
            )));
        }
        let normalized = requested
            .iter()
            .map(|p| paths::validate_file_path(p))
            .collect::<Result<Vec<_>>>()?;

        let (job, url) = self.scratch_clone(&req.git_url, req.branch.as_deref(), req.auth.as_ref())?;
        let repo = job.path().join("repo");
        git::clone_repository(&CloneSpec {
            url: &url,
            dir: &repo,
            branch: req.branch.as_deref(),
            timeout: self.config.timeouts.clone_timeout(),
        })
        .await?;
        let hashes =
            git::hash_objects(&repo, &normalized, self.config.timeouts.git_quick_timeout()).await?;

        // Report under the path the client sent.
        let mut results: Vec<FileHash> = requested
            .into_iter()
            .zip(hashes)
            .map(|(file_path, (_, sha))| FileHash { file_path, sha })
            .collect();
        if single {
            let first = results.remove(0);
            if first.sha.is_none() {
                return Err(TexdError::NotFound(format!("file '{}'", first.file_path)));
            }
            Ok(HashResponse::Single(first))
        } else {
            Ok(HashResponse::Batch { hashes: results })
        }
    }

    // ------------------------------------------------------------------
    // Thumbnails and health
    // ------------------------------------------------------------------

    pub async fn thumbnail(&self, req: &ThumbnailRequest) -> Result<Thumbnail> {
        let opts = paths::validate_thumbnail_options(req.width, req.format.as_deref())?;
        let limit = self.config.limits.max_thumbnail_pdf_bytes;
        // base64 inflates by 4/3; reject obviously oversized input before decoding.
        if req.pdf_base64.len() / 4 * 3 > limit + 3 {
            return Err(TexdError::PayloadTooLarge {
                what: "bytes",
                limit: limit as u64,
            });
        }
        let pdf = STANDARD
            .decode(req.pdf_base64.trim())
            .map_err(|e| TexdError::invalid(format!("pdfBase64 is not valid base64: {}", e)))?;
        if pdf.len() > limit {
            return Err(TexdError::PayloadTooLarge {
                what: "bytes",
                limit: limit as u64,
            });
        }
        let job = JobDir::create(&self.config.paths.work_root)?;
        let bytes =
            thumbnail::render_first_page(&pdf, opts, job.path(), self.config.timeouts.thumbnail_timeout())
                .await?;
        Ok(Thumbnail {
            bytes,
            content_type: opts.format.content_type(),
        })
    }

    /// Probes the external tools and reports queue occupancy.
    pub async fn health(&self) -> HealthReport {
        let timeout = self.config.timeouts.probe_timeout();
        let (latexmk, git_ok, pdftoppm) = tokio::join!(
            compile::probe_latexmk(timeout),
            git::probe(timeout),
            thumbnail::probe_pdftoppm(timeout),
        );
        let checks = HealthChecks {
            latexmk,
            git: git_ok,
            pdftoppm,
        };
        let disk_free_bytes = fs2::available_space(&self.config.paths.work_root).ok();
        HealthReport {
            status: if checks.all_ok() { "ok" } else { "degraded" },
            checks,
            queue: self.queue.stats(),
            disk_free_bytes,
        }
    }
}

fn validate_paper_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > MAX_PAPER_ID_LEN {
        return Err(TexdError::invalid(format!(
            "paperId must be 1-{} characters",
            MAX_PAPER_ID_LEN
        )));
    }
    if id.chars().any(char::is_control) {
        return Err(TexdError::invalid("paperId contains control characters"));
    }
    Ok(())
}

/// The target must exist in the checkout, as a file and not a symlink out.
fn ensure_target(repo: &Path, target: &str) -> Result<()> {
    match paths::safe_existing_path(repo, target) {
        Some(p) if p.is_file() => Ok(()),
        _ => Err(TexdError::NotFound(format!("target '{}'", target))),
    }
}
