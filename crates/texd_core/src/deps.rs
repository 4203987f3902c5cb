//! Source dependencies of a successful build.
//!
//! The primary source is latexmk's `.fls` recorder file. Bibliography
//! databases are often read by bibtex/biber outside the recorder, so they are
//! recovered separately from `\bibdata{}` in the `.aux` file and
//! `<bcf:datasource>` in the `.bcf` file.

use crate::paths::{normalize_relative, to_slash};
use regex::Regex;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

/// Build artifacts that show up as INPUT lines but are never sources.
const GENERATED_EXTENSIONS: &[&str] = &[
    ".aux",
    ".log",
    ".fls",
    ".fdb_latexmk",
    ".out",
    ".toc",
    ".lof",
    ".lot",
    ".bbl",
    ".blg",
    ".bcf",
    ".run.xml",
];

/// Where a build put its files.
#[derive(Debug, Clone, Copy)]
pub struct BuildLayout<'a> {
    /// Root of the checked-out repository.
    pub repo_root: &'a Path,
    /// Target path relative to `repo_root`.
    pub target: &'a str,
    pub aux_dir: &'a Path,
    pub out_dir: &'a Path,
}

impl BuildLayout<'_> {
    fn target_path(&self) -> PathBuf {
        self.repo_root.join(self.target)
    }

    fn target_dir(&self) -> PathBuf {
        self.target_path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.repo_root.to_path_buf())
    }

    fn stem(&self) -> String {
        Path::new(self.target)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// `<stem>.<ext>` in out, aux, then the target directory.
    fn find_generated(&self, ext: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
        let name = format!("{}.{}", self.stem(), ext);
        dirs.iter().map(|d| d.join(&name)).find(|p| p.is_file())
    }
}

/// Parsed recorder file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlsRecord {
    pub pwd: Option<String>,
    pub inputs: Vec<String>,
}

pub fn parse_fls(content: &str) -> FlsRecord {
    let mut record = FlsRecord::default();
    for line in content.lines() {
        if let Some(pwd) = line.strip_prefix("PWD ") {
            record.pwd = Some(pwd.trim_end().to_string());
        } else if let Some(input) = line.strip_prefix("INPUT ") {
            record.inputs.push(input.trim_end().to_string());
        }
    }
    record
}

fn is_generated(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    GENERATED_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Lexically normalizes an absolute path, resolving `.` and `..`.
fn normalize_absolute(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

/// Maps one recorder path to a repository-relative path.
///
/// Absolute paths must fall inside `repo_root`; relative ones (with or
/// without `./`) are taken relative to `pwd`. Returns `None` for anything
/// outside the repository.
pub fn resolve_input(repo_root: &Path, pwd: &Path, input: &str) -> Option<String> {
    let raw = Path::new(input);
    let absolute = if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        pwd.join(input.strip_prefix("./").unwrap_or(input))
    };
    let absolute = normalize_absolute(&absolute);

    let roots = [
        repo_root.to_path_buf(),
        fs::canonicalize(repo_root).unwrap_or_else(|_| repo_root.to_path_buf()),
    ];
    let rel = roots
        .iter()
        .find_map(|root| absolute.strip_prefix(normalize_absolute(root)).ok())?;
    let rel = normalize_relative(&to_slash(rel))?;
    Some(to_slash(&rel))
}

fn fls_dependencies(layout: &BuildLayout<'_>, found: &mut BTreeSet<String>) {
    let dirs = [
        layout.out_dir.to_path_buf(),
        layout.aux_dir.to_path_buf(),
        layout.target_dir(),
    ];
    let Some(fls_path) = layout.find_generated("fls", &dirs) else {
        debug!(target = layout.target, "no recorder file found");
        return;
    };
    let Ok(content) = fs::read_to_string(&fls_path) else {
        return;
    };
    let record = parse_fls(&content);
    let pwd = record
        .pwd
        .map(PathBuf::from)
        .unwrap_or_else(|| layout.target_dir());

    for input in &record.inputs {
        if is_generated(input) {
            continue;
        }
        if let Some(rel) = resolve_input(layout.repo_root, &pwd, input) {
            found.insert(rel);
        }
    }
}

fn bibdata_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\\bibdata\{([^}]*)\}").expect("static regex"))
}

fn datasource_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"<bcf:datasource[^>]*>([^<]+)</bcf:datasource>").expect("static regex")
    })
}

/// Names listed in `\bibdata{a,b}`; bibtex appends `.bib` itself.
pub fn parse_bibdata(aux: &str) -> Vec<String> {
    bibdata_regex()
        .captures_iter(aux)
        .flat_map(|c| {
            c[1].split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        })
        .map(|name| {
            if name.to_ascii_lowercase().ends_with(".bib") {
                name
            } else {
                format!("{}.bib", name)
            }
        })
        .collect()
}

pub fn parse_bcf_datasources(bcf: &str) -> Vec<String> {
    datasource_regex()
        .captures_iter(bcf)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn bib_dependencies(layout: &BuildLayout<'_>, found: &mut BTreeSet<String>) {
    let dirs = [layout.aux_dir.to_path_buf(), layout.target_dir()];
    let mut names = Vec::new();
    if let Some(aux) = layout.find_generated("aux", &dirs) {
        if let Ok(content) = fs::read_to_string(aux) {
            names.extend(parse_bibdata(&content));
        }
    }
    if let Some(bcf) = layout.find_generated("bcf", &dirs) {
        if let Ok(content) = fs::read_to_string(bcf) {
            names.extend(parse_bcf_datasources(&content));
        }
    }

    let target_dir = layout.target_dir();
    for name in names {
        if let Some(rel) = resolve_input(layout.repo_root, &target_dir, &name) {
            found.insert(rel);
        }
    }
}

/// Union of recorder inputs and bibliography databases, limited to files
/// that exist inside the repository. Sorted and deduplicated.
pub fn extract_dependencies(layout: &BuildLayout<'_>) -> Vec<String> {
    let mut found = BTreeSet::new();
    fls_dependencies(layout, &mut found);
    bib_dependencies(layout, &mut found);

    found
        .into_iter()
        .filter(|rel| crate::paths::safe_existing_path(layout.repo_root, rel).is_some_and(|p| p.is_file()))
        .collect()
}
