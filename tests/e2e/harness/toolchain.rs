//! A stand-in for latexmk that behaves like it on the fixture papers.
//!
//! It follows `\input`, `\include` and `\includegraphics` from the target,
//! fails with LaTeX's missing-file message when one is absent from the
//! working tree, and otherwise writes a PDF plus the `.fls` and `.aux`
//! files dependency extraction reads. git operations are real.

use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use texd_core::process::ProcessOutput;
use texd_core::{git, CompileJob, Toolchain};
use tokio::sync::{mpsc, Semaphore};

const SYSTEM_CLASS: &str = "/usr/share/texlive/texmf-dist/tex/latex/base/article.cls";

pub struct PaperToolchain {
    compiles: AtomicUsize,
    /// Per run: whether the aux directory already held `<stem>.aux`.
    warm_aux: Mutex<Vec<bool>>,
    /// When set, each run waits for a permit before doing anything.
    gate: Option<Arc<Semaphore>>,
    git_timeout: Duration,
}

impl Default for PaperToolchain {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperToolchain {
    pub fn new() -> Self {
        Self {
            compiles: AtomicUsize::new(0),
            warm_aux: Mutex::new(Vec::new()),
            gate: None,
            git_timeout: Duration::from_secs(30),
        }
    }

    /// Runs block until `gate` has a permit.
    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new()
        }
    }

    pub fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    pub fn warm_aux(&self) -> Vec<bool> {
        self.warm_aux.lock().unwrap().clone()
    }
}

fn reference_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\\(input|include|includegraphics|bibliography)(?:\[[^\]]*\])?\{([^}]+)\}")
            .unwrap()
    })
}

#[derive(Default)]
struct Scan {
    inputs: Vec<String>,
    bibdata: Vec<String>,
}

/// Walks the include graph from the target. `Err` is the missing file.
fn scan(base: &Path, target: &str) -> Result<Scan, String> {
    let mut scan = Scan::default();
    let mut seen = BTreeSet::new();
    let mut pending = vec![target.to_string()];

    while let Some(file) = pending.pop() {
        if !seen.insert(file.clone()) {
            continue;
        }
        let source = fs::read_to_string(base.join(&file)).map_err(|_| file.clone())?;
        scan.inputs.push(file.clone());
        for caps in reference_regex().captures_iter(&source) {
            let arg = caps[2].trim();
            match &caps[1] {
                "bibliography" => scan
                    .bibdata
                    .extend(arg.split(',').map(|s| s.trim().to_string())),
                "includegraphics" => {
                    if !base.join(arg).is_file() {
                        return Err(arg.to_string());
                    }
                    scan.inputs.push(arg.to_string());
                }
                _ => {
                    let name = if Path::new(arg).extension().is_some() {
                        arg.to_string()
                    } else {
                        format!("{}.tex", arg)
                    };
                    pending.push(name);
                }
            }
        }
    }
    Ok(scan)
}

fn stem(job: &CompileJob) -> String {
    Path::new(&job.target)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Produces what latexmk would for `job`. `Err` carries the failure log.
fn render(job: &CompileJob) -> Result<String, String> {
    let target_path = job.repo_root.join(&job.target);
    let base: PathBuf = target_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| job.repo_root.clone());
    let file_name = target_path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = stem(job);

    let scan = scan(&base, &file_name).map_err(|missing| {
        format!(
            "This is pdfTeX, Version 3.141592653\n./{}:10: LaTeX Error: File `{}' not found.\n\nType X to quit or <RETURN> to proceed,\n",
            file_name, missing
        )
    })?;

    let io = |e: std::io::Error| format!("I/O error: {}", e);
    fs::create_dir_all(&job.aux_dir).map_err(io)?;
    fs::create_dir_all(&job.out_dir).map_err(io)?;

    let mut fls = format!("PWD {}\n", base.display());
    let _ = writeln!(fls, "INPUT {}", SYSTEM_CLASS);
    for (i, input) in scan.inputs.iter().enumerate() {
        if i == 0 {
            let _ = writeln!(fls, "INPUT {}", base.join(input).display());
        } else {
            let _ = writeln!(fls, "INPUT ./{}", input);
        }
    }
    let _ = writeln!(fls, "INPUT {}", job.aux_dir.join(format!("{}.aux", stem)).display());
    let _ = writeln!(fls, "OUTPUT {}", job.out_dir.join(format!("{}.pdf", stem)).display());
    fs::write(job.aux_dir.join(format!("{}.fls", stem)), fls).map_err(io)?;

    let mut aux = String::from("\\relax\n");
    if !scan.bibdata.is_empty() {
        let _ = writeln!(aux, "\\bibdata{{{}}}", scan.bibdata.join(","));
    }
    fs::write(job.aux_dir.join(format!("{}.aux", stem)), aux).map_err(io)?;

    let pdf = format!("%PDF-1.5\n% {} via {}\n%%EOF\n", job.target, job.compiler);
    fs::write(job.pdf_path(), pdf).map_err(io)?;

    Ok(format!(
        "Latexmk: applying rule '{}'...\nOutput written on {}.pdf (1 page).\nLatexmk: All targets ({}.pdf) are up-to-date\n",
        job.compiler, stem, stem
    ))
}

#[async_trait]
impl Toolchain for PaperToolchain {
    async fn compile(
        &self,
        job: &CompileJob,
        lines: Option<mpsc::UnboundedSender<String>>,
    ) -> ProcessOutput {
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await;
        }
        self.compiles.fetch_add(1, Ordering::SeqCst);
        let warm = job.aux_dir.join(format!("{}.aux", stem(job))).is_file();
        self.warm_aux.lock().unwrap().push(warm);

        let (success, log) = match render(job) {
            Ok(log) => (true, log),
            Err(log) => (false, log),
        };
        if let Some(tx) = lines {
            for line in log.lines() {
                let _ = tx.send(line.to_string());
            }
        }
        ProcessOutput {
            success,
            stdout: log,
            exit_code: Some(if success { 0 } else { 12 }),
            ..Default::default()
        }
    }

    async fn list_tree(&self, repo: &Path) -> texd_core::Result<Vec<String>> {
        git::list_tree(repo, self.git_timeout).await
    }

    async fn extend_sparse(&self, repo: &Path, paths: &[String]) -> texd_core::Result<()> {
        git::extend_sparse_paths(repo, paths, self.git_timeout).await
    }
}
