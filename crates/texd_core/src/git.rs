//! Git operations, all by shelling out to the `git` binary.
//!
//! Remote URLs passed in here may carry credentials; they are redacted from
//! every message that leaves this module.

use crate::error::{Result, TexdError};
use crate::process::{self, ProcessOutput, RunOptions};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info};

/// Files latexmk reads from the repository root on its own.
pub const LATEXMKRC_FILES: &[&str] = &[".latexmkrc", "latexmkrc"];

/// Optional HTTPS credentials supplied with a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitAuth {
    pub token: String,
    #[serde(default)]
    pub username: Option<String>,
}

/// Parameters shared by the clone operations.
#[derive(Debug, Clone, Copy)]
pub struct CloneSpec<'a> {
    /// Remote URL, possibly with credentials embedded.
    pub url: &'a str,
    pub dir: &'a Path,
    /// The remote's default branch when `None`.
    pub branch: Option<&'a str>,
    pub timeout: Duration,
}

impl CloneSpec<'_> {
    /// `git clone` arguments shared by every variant, up to the options.
    fn clone_args<'s>(&'s self, dir: &'s str, extra: &[&'s str]) -> Vec<&'s str> {
        let mut args = vec!["clone", "--depth", "1", "--single-branch"];
        if let Some(branch) = self.branch {
            args.push("--branch");
            args.push(branch);
        }
        args.extend_from_slice(extra);
        args.extend_from_slice(&["--", self.url, dir]);
        args
    }
}

/// Result of an incremental update of a persistent working tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// True when the tree was reset to a new commit.
    pub changed: bool,
    pub head: String,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: TreeEntryKind,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TreeEntryKind {
    File,
    Dir,
    Submodule,
}

/// Commit details shown to users when refs change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommitDetails {
    pub message: String,
    pub date: String,
    /// True when `date` is the lookup time because the commit itself could
    /// not be fetched.
    pub date_is_fallback: bool,
    pub author_name: String,
    pub author_email: String,
}

/// Injects `auth` into an `https://` URL. Other schemes are returned as-is.
pub fn authenticated_url(url: &str, auth: Option<&GitAuth>) -> String {
    let Some(auth) = auth.filter(|a| !a.token.is_empty()) else {
        return url.to_string();
    };
    let Some(rest) = url.strip_prefix("https://") else {
        return url.to_string();
    };
    // Drop any credentials already present.
    let rest = match rest.split_once('/') {
        Some((host, path)) => {
            let host = host.rsplit('@').next().unwrap_or(host);
            format!("{}/{}", host, path)
        }
        None => rest.rsplit('@').next().unwrap_or(rest).to_string(),
    };
    let user = auth.username.as_deref().unwrap_or("x-access-token");
    format!(
        "https://{}:{}@{}",
        percent_encode_userinfo(user),
        percent_encode_userinfo(&auth.token),
        rest
    )
}

fn percent_encode_userinfo(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || b"-._~".contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// Replaces `scheme://user:pass@` credentials with `***`.
pub fn redact_url(text: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"([a-zA-Z][a-zA-Z0-9+.-]*://)[^/@\s]+@").expect("static regex")
    });
    re.replace_all(text, "${1}***@").into_owned()
}

/// Removes `user:pass@` from every URL in `text`.
pub fn strip_credentials(text: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"([a-zA-Z][a-zA-Z0-9+.-]*://)[^/@\s]+@").expect("static regex")
    });
    re.replace_all(text, "${1}").into_owned()
}

/// Rewrites `origin` in `repo` without embedded credentials. Returns
/// whether the URL changed.
pub async fn scrub_origin_credentials(repo: &Path, timeout: Duration) -> Result<bool> {
    let out = git_ok("remote", &["remote", "get-url", "origin"], Some(repo), timeout).await?;
    let current = out.stdout.trim();
    let clean = strip_credentials(current);
    if clean == current {
        return Ok(false);
    }
    git_ok(
        "remote",
        &["remote", "set-url", "origin", &clean],
        Some(repo),
        timeout,
    )
    .await?;
    debug!(url = %clean, "removed credentials from origin");
    Ok(true)
}

async fn git(args: &[&str], cwd: Option<&Path>, timeout: Duration) -> ProcessOutput {
    let mut opts = RunOptions::new(timeout)
        .env("GIT_TERMINAL_PROMPT", "0")
        .env("GIT_ASKPASS", "echo")
        .env("GIT_LFS_SKIP_SMUDGE", "1");
    if let Some(dir) = cwd {
        opts = opts.cwd(dir);
    }
    process::run("git", args, &opts).await
}

/// Runs git and converts failure into [`TexdError::Git`].
async fn git_ok(
    operation: &'static str,
    args: &[&str],
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<ProcessOutput> {
    let out = git(args, cwd, timeout).await;
    if out.success {
        Ok(out)
    } else {
        Err(TexdError::Git {
            operation,
            message: redact_url(&out.failure_reason()),
            timed_out: out.timed_out,
        })
    }
}

/// Shallow, single-branch clone.
pub async fn clone_repository(spec: &CloneSpec<'_>) -> Result<()> {
    let dir = spec.dir.to_string_lossy();
    info!(url = %redact_url(spec.url), branch = ?spec.branch, "cloning repository");
    git_ok("clone", &spec.clone_args(&dir, &[]), None, spec.timeout).await?;
    Ok(())
}

/// Shallow clone with no working tree and no blobs: enough for `ls-tree`.
pub async fn clone_tree_only(spec: &CloneSpec<'_>) -> Result<()> {
    let dir = spec.dir.to_string_lossy();
    debug!(url = %redact_url(spec.url), branch = ?spec.branch, "cloning tree only");
    git_ok(
        "clone",
        &spec.clone_args(&dir, &["--no-checkout", "--filter=blob:none"]),
        None,
        spec.timeout,
    )
    .await?;
    Ok(())
}

/// Shallow clone that only materializes `sparse_paths` plus latexmkrc files.
///
/// Callers fall back to [`clone_repository`] on failure; the destination is
/// removed before returning an error so the fallback starts clean.
pub async fn clone_repository_sparse(spec: &CloneSpec<'_>, sparse_paths: &[String]) -> Result<()> {
    let result = clone_sparse_inner(spec, sparse_paths).await;
    if result.is_err() && spec.dir.exists() {
        let _ = fs::remove_dir_all(spec.dir);
    }
    result
}

async fn clone_sparse_inner(spec: &CloneSpec<'_>, sparse_paths: &[String]) -> Result<()> {
    info!(
        url = %redact_url(spec.url),
        branch = ?spec.branch,
        paths = sparse_paths.len(),
        "sparse cloning repository"
    );
    clone_tree_only(spec).await?;
    apply_sparse_paths(spec.dir, sparse_paths, spec.timeout).await?;
    Ok(())
}

/// Writes the non-cone sparse pattern file and updates the working tree.
pub async fn apply_sparse_paths(repo: &Path, paths: &[String], timeout: Duration) -> Result<()> {
    git_ok(
        "sparse-checkout",
        &["config", "core.sparseCheckout", "true"],
        Some(repo),
        timeout,
    )
    .await?;

    let info_dir = repo.join(".git").join("info");
    fs::create_dir_all(&info_dir)?;
    fs::write(info_dir.join("sparse-checkout"), sparse_patterns(paths))?;

    git_ok(
        "sparse-checkout",
        &["read-tree", "-mu", "HEAD"],
        Some(repo),
        timeout,
    )
    .await?;
    debug!(repo = %repo.display(), paths = paths.len(), "applied sparse checkout");
    Ok(())
}

/// Adds `extra` to the existing sparse set and reapplies it.
pub async fn extend_sparse_paths(repo: &Path, extra: &[String], timeout: Duration) -> Result<()> {
    let mut paths = read_sparse_paths(repo);
    for p in extra {
        if !paths.contains(p) {
            paths.push(p.clone());
        }
    }
    apply_sparse_paths(repo, &paths, timeout).await
}

/// Turns sparse checkout off, materializing the full tree.
pub async fn disable_sparse(repo: &Path, timeout: Duration) -> Result<()> {
    if !is_sparse(repo) {
        return Ok(());
    }
    git_ok(
        "sparse-checkout",
        &["sparse-checkout", "disable"],
        Some(repo),
        timeout,
    )
    .await?;
    Ok(())
}

/// True if the working tree has sparse checkout enabled.
pub fn is_sparse(repo: &Path) -> bool {
    let config = fs::read_to_string(repo.join(".git").join("config")).unwrap_or_default();
    config
        .lines()
        .map(|l| l.trim().replace(' ', "").to_ascii_lowercase())
        .any(|l| l == "sparsecheckout=true")
}

/// Paths recorded in the sparse pattern file, without the latexmkrc defaults.
pub fn read_sparse_paths(repo: &Path) -> Vec<String> {
    let content = fs::read_to_string(repo.join(".git").join("info").join("sparse-checkout"))
        .unwrap_or_default();
    content
        .lines()
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(unescape_pattern)
        .filter(|p| !LATEXMKRC_FILES.contains(&p.as_str()))
        .collect()
}

/// Non-cone patterns anchored at the repository root. latexmkrc files are
/// always included.
pub fn sparse_patterns(paths: &[String]) -> String {
    let mut out = String::new();
    let mut seen = std::collections::HashSet::new();
    for p in LATEXMKRC_FILES
        .iter()
        .map(|s| s.to_string())
        .chain(paths.iter().cloned())
    {
        let p = p.trim_start_matches("./").trim_start_matches('/').to_string();
        if p.is_empty() || !seen.insert(p.clone()) {
            continue;
        }
        out.push('/');
        out.push_str(&escape_pattern(&p));
        out.push('\n');
    }
    out
}

fn escape_pattern(p: &str) -> String {
    let mut out = String::with_capacity(p.len());
    for c in p.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '!' | '#' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn unescape_pattern(line: &str) -> String {
    let line = line.trim_start_matches('/');
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Brings a persistent working tree up to date with `branch` on `url`.
///
/// Skips the reset entirely when the fetched commit equals the local HEAD.
/// Sparse checkout is then reapplied (`Some`) or disabled (`None`) to match
/// the current request.
pub async fn update_repository(
    spec: &CloneSpec<'_>,
    sparse_paths: Option<&[String]>,
) -> Result<UpdateOutcome> {
    let repo = spec.dir;
    git_ok(
        "remote",
        &["remote", "set-url", "origin", spec.url],
        Some(repo),
        spec.timeout,
    )
    .await?;
    git_ok(
        "fetch",
        &["fetch", "--depth", "1", "origin", spec.branch.unwrap_or("HEAD")],
        Some(repo),
        spec.timeout,
    )
    .await?;

    let local = rev_parse(repo, "HEAD", spec.timeout).await.ok();
    let remote = rev_parse(repo, "FETCH_HEAD", spec.timeout).await?;

    let changed = local.as_deref() != Some(remote.as_str());
    if changed {
        info!(from = ?local, to = %remote, "resetting persistent tree");
        git_ok(
            "reset",
            &["reset", "--hard", "FETCH_HEAD"],
            Some(repo),
            spec.timeout,
        )
        .await?;
        git_ok("clean", &["clean", "-fd"], Some(repo), spec.timeout).await?;
    } else {
        debug!(head = %remote, "persistent tree already current");
    }

    match sparse_paths {
        Some(paths) => apply_sparse_paths(repo, paths, spec.timeout).await?,
        None => disable_sparse(repo, spec.timeout).await?,
    }

    Ok(UpdateOutcome {
        changed,
        head: remote,
    })
}

pub async fn rev_parse(repo: &Path, rev: &str, timeout: Duration) -> Result<String> {
    let out = git_ok("rev-parse", &["rev-parse", rev], Some(repo), timeout).await?;
    Ok(out.stdout.trim().to_string())
}

/// Every file path in HEAD, regardless of what is checked out.
pub async fn list_tree(repo: &Path, timeout: Duration) -> Result<Vec<String>> {
    let out = git_ok(
        "ls-tree",
        &["-c", "core.quotePath=false", "ls-tree", "-r", "--name-only", "HEAD"],
        Some(repo),
        timeout,
    )
    .await?;
    Ok(out
        .stdout
        .lines()
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Immediate children of `path` (the root when `None`) in HEAD.
pub async fn list_directory(
    repo: &Path,
    path: Option<&str>,
    timeout: Duration,
) -> Result<Vec<TreeEntry>> {
    let spec;
    let mut args = vec!["-c", "core.quotePath=false", "ls-tree", "HEAD"];
    if let Some(p) = path.filter(|p| !p.is_empty()) {
        spec = format!("{}/", p.trim_end_matches('/'));
        args.push("--");
        args.push(&spec);
    }
    let out = git_ok("ls-tree", &args, Some(repo), timeout).await?;
    let mut entries: Vec<TreeEntry> = out.stdout.lines().filter_map(parse_ls_tree_line).collect();
    entries.sort_by(|a, b| {
        (a.kind != TreeEntryKind::Dir, &a.name).cmp(&(b.kind != TreeEntryKind::Dir, &b.name))
    });
    Ok(entries)
}

/// Parses `<mode> <type> <sha>\t<path>`.
fn parse_ls_tree_line(line: &str) -> Option<TreeEntry> {
    let (meta, path) = line.split_once('\t')?;
    let kind = match meta.split_whitespace().nth(1)? {
        "blob" => TreeEntryKind::File,
        "tree" => TreeEntryKind::Dir,
        "commit" => TreeEntryKind::Submodule,
        _ => return None,
    };
    let name = path.rsplit('/').next().unwrap_or(path).to_string();
    Some(TreeEntry {
        name,
        path: path.to_string(),
        kind,
    })
}

/// `git hash-object` for each path; `None` where the file is missing.
pub async fn hash_objects(
    repo: &Path,
    paths: &[String],
    timeout: Duration,
) -> Result<Vec<(String, Option<String>)>> {
    let mut results = Vec::with_capacity(paths.len());
    let existing: Vec<&String> = paths
        .iter()
        .filter(|p| crate::paths::safe_existing_path(repo, p).is_some_and(|f| f.is_file()))
        .collect();

    let mut hashes = std::collections::HashMap::new();
    if !existing.is_empty() {
        let mut args = vec!["hash-object", "--"];
        args.extend(existing.iter().map(|s| s.as_str()));
        let out = git_ok("hash-object", &args, Some(repo), timeout).await?;
        for (path, sha) in existing.iter().zip(out.stdout.lines()) {
            hashes.insert(path.as_str(), sha.trim().to_string());
        }
    }
    for p in paths {
        results.push((p.clone(), hashes.get(p.as_str()).cloned()));
    }
    Ok(results)
}

/// Output of `git ls-remote --symref <url> HEAD [refs/heads/<branch>]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteRefs {
    /// Branch HEAD points at, if the server advertised the symref.
    pub default_branch: Option<String>,
    pub head_sha: Option<String>,
    /// `(branch name, sha)` for every `refs/heads/*` line.
    pub branches: Vec<(String, String)>,
}

impl RemoteRefs {
    pub fn branch_sha(&self, branch: &str) -> Option<&str> {
        self.branches
            .iter()
            .find(|(b, _)| b == branch)
            .map(|(_, s)| s.as_str())
    }

    /// When no symref was advertised, guess the default branch as the
    /// branch whose tip equals HEAD, preferring `main` then `master`.
    pub fn infer_default_branch(&self) -> Option<String> {
        if let Some(b) = &self.default_branch {
            return Some(b.clone());
        }
        let head = self.head_sha.as_deref()?;
        let candidates: Vec<&str> = self
            .branches
            .iter()
            .filter(|(_, s)| s == head)
            .map(|(b, _)| b.as_str())
            .collect();
        ["main", "master"]
            .iter()
            .find(|p| candidates.contains(p))
            .map(|s| s.to_string())
            .or_else(|| candidates.first().map(|s| s.to_string()))
    }
}

pub fn parse_ls_remote(output: &str) -> RemoteRefs {
    let mut refs = RemoteRefs::default();
    for line in output.lines() {
        if let Some(rest) = line.strip_prefix("ref: ") {
            if let Some((target, name)) = rest.split_once('\t') {
                if name == "HEAD" {
                    refs.default_branch = target.strip_prefix("refs/heads/").map(str::to_string);
                }
            }
            continue;
        }
        let Some((sha, name)) = line.split_once('\t') else {
            continue;
        };
        if name == "HEAD" {
            refs.head_sha = Some(sha.to_string());
        } else if let Some(branch) = name.strip_prefix("refs/heads/") {
            refs.branches.push((branch.to_string(), sha.to_string()));
        }
    }
    refs
}

/// One round trip: HEAD symref plus the requested branch, if any.
pub async fn ls_remote_symref(url: &str, branch: Option<&str>, timeout: Duration) -> Result<RemoteRefs> {
    let branch_ref = branch.map(|b| format!("refs/heads/{}", b));
    let mut args = vec!["ls-remote", "--symref", "--", url, "HEAD"];
    if let Some(r) = &branch_ref {
        args.push(r);
    }
    let out = git_ok("ls-remote", &args, None, timeout).await?;
    Ok(parse_ls_remote(&out.stdout))
}

/// Full `ls-remote` of all heads.
pub async fn ls_remote_all(url: &str, timeout: Duration) -> Result<RemoteRefs> {
    let out = git_ok("ls-remote", &["ls-remote", "--", url], None, timeout).await?;
    Ok(parse_ls_remote(&out.stdout))
}

/// Fetches one commit into a throwaway bare repo under `scratch` and reads
/// its metadata. The caller owns (and removes) `scratch`.
pub async fn fetch_commit_details(
    url: &str,
    sha: &str,
    branch: &str,
    scratch: &Path,
    timeout: Duration,
) -> Result<CommitDetails> {
    let bare = scratch.join("meta.git");
    let bare_str = bare.to_string_lossy();
    git_ok("init", &["init", "--bare", "--quiet", &bare_str], None, timeout).await?;

    // Fetching by sha needs server support; the branch tip is the fallback.
    let by_sha = git(
        &["fetch", "--depth", "1", "--filter=blob:none", "--", url, sha],
        Some(&bare),
        timeout,
    )
    .await;
    if !by_sha.success {
        git_ok(
            "fetch",
            &["fetch", "--depth", "1", "--filter=blob:none", "--", url, branch],
            Some(&bare),
            timeout,
        )
        .await?;
    }

    let out = git_ok(
        "log",
        &["log", "-1", "--format=%s%x00%cI%x00%an%x00%ae", "FETCH_HEAD"],
        Some(&bare),
        timeout,
    )
    .await?;
    parse_commit_details(&out.stdout)
        .ok_or_else(|| TexdError::Git {
            operation: "log",
            message: "unexpected log output".into(),
            timed_out: false,
        })
}

fn parse_commit_details(output: &str) -> Option<CommitDetails> {
    let mut parts = output.trim_end_matches('\n').split('\0');
    Some(CommitDetails {
        message: parts.next()?.to_string(),
        date: parts.next()?.to_string(),
        date_is_fallback: false,
        author_name: parts.next()?.to_string(),
        author_email: parts.next()?.to_string(),
    })
}

/// `git --version`, used by health checks.
pub async fn probe(timeout: Duration) -> bool {
    git(&["--version"], None, timeout).await.success
}
