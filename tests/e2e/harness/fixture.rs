use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use tempfile::TempDir;

/// True if a `git` binary is on PATH.
pub fn git_available() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(|| {
        Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    })
}

/// A local git repository on branch `main`, reachable as a `file://` URL.
pub struct GitFixture {
    dir: TempDir,
}

impl GitFixture {
    /// Copies `tests/fixtures/<name>` into a fresh repository and commits it.
    pub fn from_fixture(name: &str) -> Result<Self> {
        let fixture_path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("fixtures")
            .join(name);
        if !fixture_path.exists() {
            bail!("Fixture not found: {}", fixture_path.display());
        }

        let dir = TempDir::new().context("Failed to create temp directory")?;
        copy_dir_recursive(&fixture_path, dir.path())?;

        let fixture = Self { dir };
        fixture.git(&["init", "-q"])?;
        fixture.git(&["symbolic-ref", "HEAD", "refs/heads/main"])?;
        fixture.git(&["add", "-A"])?;
        fixture.git(&["commit", "-q", "-m", "Initial commit"])?;
        Ok(fixture)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn url(&self) -> String {
        format!("file://{}", self.path().display())
    }

    /// Writes `path` and commits it on the current branch.
    pub fn commit_file(&self, path: &str, content: &[u8], message: &str) -> Result<String> {
        let full_path = self.path().join(path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directories for {}", path))?;
        }
        fs::write(&full_path, content).with_context(|| format!("Failed to write file: {}", path))?;
        self.git(&["add", path])?;
        self.git(&["commit", "-q", "-m", message])?;
        self.head()
    }

    /// Creates `branch` at the current commit without switching to it.
    pub fn branch(&self, branch: &str) -> Result<()> {
        self.git(&["branch", branch])?;
        Ok(())
    }

    pub fn head(&self) -> Result<String> {
        Ok(self.git(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Blob id of `path` at HEAD, as `git hash-object` would report it.
    pub fn blob_sha(&self, path: &str) -> Result<String> {
        Ok(self
            .git(&["rev-parse", &format!("HEAD:{}", path)])?
            .trim()
            .to_string())
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        let out = Command::new("git")
            .args([
                "-c",
                "user.name=texd tests",
                "-c",
                "user.email=tests@texd.invalid",
                "-c",
                "commit.gpgsign=false",
            ])
            .args(args)
            .current_dir(self.path())
            .output()
            .with_context(|| format!("Failed to run git {:?}", args))?;
        if !out.status.success() {
            bail!(
                "git {:?} failed: {}",
                args,
                String::from_utf8_lossy(&out.stderr)
            );
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

/// Recursively copy directory contents
fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if file_type.is_dir() {
            fs::create_dir_all(&dst_path)?;
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}
