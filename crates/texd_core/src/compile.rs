//! latexmk invocation and the sparse-checkout repair retry.

use crate::error::{Result, TexdError};
use crate::git;
use crate::paths::{normalize_relative, to_slash, Compiler};
use crate::process::{self, ProcessOutput, RunOptions};
use crate::progress::ProgressTracker;
use async_trait::async_trait;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Compile logs returned to clients are cut to this many trailing bytes.
pub const MAX_LOG_BYTES: usize = 64 * 1024;

/// One latexmk run.
#[derive(Debug, Clone)]
pub struct CompileJob {
    pub repo_root: PathBuf,
    /// Relative to `repo_root`.
    pub target: String,
    pub compiler: Compiler,
    pub aux_dir: PathBuf,
    pub out_dir: PathBuf,
    pub timeout: Duration,
}

impl CompileJob {
    fn stem(&self) -> String {
        Path::new(&self.target)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Where latexmk writes the PDF.
    pub fn pdf_path(&self) -> PathBuf {
        self.out_dir.join(format!("{}.pdf", self.stem()))
    }

    /// Command line, excluding the `latexmk` program name.
    pub fn latexmk_args(&self) -> Vec<String> {
        vec![
            self.compiler.latexmk_flag().to_string(),
            "-interaction=nonstopmode".to_string(),
            "-file-line-error".to_string(),
            "-recorder".to_string(),
            format!("-auxdir={}", self.aux_dir.display()),
            format!("-outdir={}", self.out_dir.display()),
            "-cd".to_string(),
            self.target.clone(),
        ]
    }
}

/// External tools used while compiling.
#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Runs latexmk, forwarding stdout lines to `lines` as they arrive.
    async fn compile(
        &self,
        job: &CompileJob,
        lines: Option<mpsc::UnboundedSender<String>>,
    ) -> ProcessOutput;

    /// Every path in the repository's HEAD, checked out or not.
    async fn list_tree(&self, repo: &Path) -> Result<Vec<String>>;

    /// Adds `paths` to the sparse set and checks them out.
    async fn extend_sparse(&self, repo: &Path, paths: &[String]) -> Result<()>;
}

/// [`Toolchain`] backed by the installed `latexmk` and `git` binaries.
#[derive(Debug, Clone)]
pub struct SystemToolchain {
    pub git_timeout: Duration,
}

#[async_trait]
impl Toolchain for SystemToolchain {
    async fn compile(
        &self,
        job: &CompileJob,
        lines: Option<mpsc::UnboundedSender<String>>,
    ) -> ProcessOutput {
        let args = job.latexmk_args();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let opts = RunOptions::new(job.timeout).cwd(&job.repo_root);
        process::run_with_lines("latexmk", &args, &opts, lines).await
    }

    async fn list_tree(&self, repo: &Path) -> Result<Vec<String>> {
        git::list_tree(repo, self.git_timeout).await
    }

    async fn extend_sparse(&self, repo: &Path, paths: &[String]) -> Result<()> {
        git::extend_sparse_paths(repo, paths, self.git_timeout).await
    }
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct CompileOutcome {
    pub pdf_path: PathBuf,
    pub log: String,
    /// Paths added to the sparse set by the repair retry.
    pub repaired: Vec<String>,
    pub attempts: u32,
}

fn missing_file_regexes() -> &'static [Regex; 2] {
    static RE: OnceLock<[Regex; 2]> = OnceLock::new();
    RE.get_or_init(|| {
        [
            Regex::new(r"LaTeX Error: File `([^']+)' not found").expect("static regex"),
            Regex::new(r"I can't find file `([^']+)'").expect("static regex"),
        ]
    })
}

/// The file LaTeX reported missing, if the log says so in one of the two
/// recognized forms.
pub fn missing_file_from_log(log: &str) -> Option<String> {
    missing_file_regexes()
        .iter()
        .filter_map(|re| re.captures(log))
        .map(|c| c[1].trim().to_string())
        .find(|s| !s.is_empty())
}

/// Finds `missing` in `tree`: first by exact path (relative to the repo root
/// or to the target's directory), then by a basename that matches exactly
/// one entry.
pub fn locate_in_tree(tree: &[String], missing: &str, target: &str) -> Option<String> {
    let target_dir = Path::new(target).parent().unwrap_or(Path::new(""));
    let candidates = [
        normalize_relative(missing),
        normalize_relative(&to_slash(&target_dir.join(missing))),
    ];
    for candidate in candidates.iter().flatten() {
        let candidate = to_slash(candidate);
        if tree.iter().any(|p| *p == candidate) {
            return Some(candidate);
        }
    }

    let base = Path::new(missing).file_name()?.to_string_lossy().into_owned();
    let mut matches = tree
        .iter()
        .filter(|p| p.rsplit('/').next() == Some(base.as_str()));
    let first = matches.next()?;
    if matches.next().is_some() {
        debug!(missing, "basename matches several files, not repairing");
        return None;
    }
    Some(first.clone())
}

async fn run_once(
    toolchain: &dyn Toolchain,
    job: &CompileJob,
    tracker: Option<&Arc<ProgressTracker>>,
) -> (bool, ProcessOutput) {
    // A PDF left over from an earlier build must not count as success.
    let pdf = job.pdf_path();
    if let Err(e) = fs::remove_file(&pdf) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %pdf.display(), error = %e, "could not remove previous PDF");
        }
    }

    let (tx, forwarder) = match tracker {
        Some(t) => {
            let (tx, mut rx) = mpsc::unbounded_channel::<String>();
            let t = Arc::clone(t);
            let handle = tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    t.on_line(&line);
                }
            });
            (Some(tx), Some(handle))
        }
        None => (None, None),
    };

    let output = toolchain.compile(job, tx).await;
    if let Some(handle) = forwarder {
        let _ = handle.await;
    }
    // Exit status alone is not trusted; the PDF has to exist.
    (pdf.is_file(), output)
}

/// Compiles `job`, retrying once after widening the sparse checkout when
/// LaTeX reports a missing file that exists in the repository.
pub async fn compile_with_repair(
    toolchain: &dyn Toolchain,
    job: &CompileJob,
    sparse: bool,
    tracker: Option<&Arc<ProgressTracker>>,
) -> Result<CompileOutcome> {
    let (ok, output) = run_once(toolchain, job, tracker).await;
    if ok {
        return Ok(CompileOutcome {
            pdf_path: job.pdf_path(),
            log: process::tail(&output.combined(), MAX_LOG_BYTES),
            repaired: Vec::new(),
            attempts: 1,
        });
    }

    let failure = || TexdError::CompileFailed {
        log: process::tail(&output.combined(), MAX_LOG_BYTES),
        timed_out: output.timed_out,
    };

    if !sparse || output.timed_out {
        return Err(failure());
    }
    let Some(missing) = missing_file_from_log(&output.combined()) else {
        return Err(failure());
    };

    let tree = match toolchain.list_tree(&job.repo_root).await {
        Ok(tree) => tree,
        Err(e) => {
            warn!(error = %e, "could not list repository tree for repair");
            return Err(failure());
        }
    };
    let Some(found) = locate_in_tree(&tree, &missing, &job.target) else {
        debug!(missing = %missing, "missing file not in repository");
        return Err(failure());
    };

    info!(missing = %missing, path = %found, "extending sparse checkout and retrying");
    if let Err(e) = toolchain.extend_sparse(&job.repo_root, &[found.clone()]).await {
        warn!(error = %e, "sparse checkout repair failed");
        return Err(failure());
    }

    let (ok, retry) = run_once(toolchain, job, tracker).await;
    if ok {
        Ok(CompileOutcome {
            pdf_path: job.pdf_path(),
            log: process::tail(&retry.combined(), MAX_LOG_BYTES),
            repaired: vec![found],
            attempts: 2,
        })
    } else {
        Err(TexdError::CompileFailed {
            log: process::tail(&retry.combined(), MAX_LOG_BYTES),
            timed_out: retry.timed_out,
        })
    }
}

/// `latexmk -v`, used by health checks.
pub async fn probe_latexmk(timeout: Duration) -> bool {
    process::run("latexmk", &["-v"], &RunOptions::new(timeout))
        .await
        .success
}
