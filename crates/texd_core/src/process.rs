//! External process execution with timeouts.
//!
//! Every binary the service depends on (`git`, `latexmk`, `pdftoppm`) goes
//! through [`run`]. A non-zero exit or a timeout is reported in the
//! [`ProcessOutput`], never as an `Err`; `Err` is reserved for the cases where
//! the process could not be started at all and is also folded into a failed
//! output so callers have a single control-flow path.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default timeout when a caller does not specify one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Options for a single invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Working directory (inherited when `None`).
    pub cwd: Option<PathBuf>,
    /// Hard deadline; the process is killed when it elapses.
    pub timeout: Duration,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            timeout: DEFAULT_TIMEOUT,
            env: HashMap::new(),
        }
    }
}

impl RunOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Result of running an external command.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// True only for a zero exit status within the deadline.
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// True when the process was killed by the deadline.
    pub timed_out: bool,
    /// Exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

impl ProcessOutput {
    /// stdout followed by stderr, for logs returned to users.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    /// A one-line description of why the command failed.
    pub fn failure_reason(&self) -> String {
        if self.timed_out {
            return format!("timed out after {}ms", self.duration_ms);
        }
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.lines().last().unwrap_or(stderr).to_string();
        }
        match self.exit_code {
            Some(code) => format!("exited with status {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Runs `program` with `args` and waits for it to finish or time out.
pub async fn run(program: &str, args: &[&str], opts: &RunOptions) -> ProcessOutput {
    run_with_lines(program, args, opts, None).await
}

/// Like [`run`], but also forwards each stdout line to `lines` as it is read.
///
/// Sending never blocks; a closed receiver is ignored.
pub async fn run_with_lines(
    program: &str,
    args: &[&str],
    opts: &RunOptions,
    lines: Option<mpsc::UnboundedSender<String>>,
) -> ProcessOutput {
    let start = Instant::now();
    debug!(program, args = ?args, cwd = ?opts.cwd, "spawning process");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &opts.cwd {
        cmd.current_dir(dir);
    }
    for (k, v) in &opts.env {
        cmd.env(k, v);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(program, error = %e, "failed to spawn process");
            return ProcessOutput {
                stderr: format!("failed to execute {}: {}", program, e),
                duration_ms: start.elapsed().as_millis() as u64,
                ..ProcessOutput::default()
            };
        }
    };

    let stdout_task = child
        .stdout
        .take()
        .map(|out| tokio::spawn(collect_lines(out, lines)));
    let stderr_task = child
        .stderr
        .take()
        .map(|err| tokio::spawn(collect_lines(err, None)));

    let waited = tokio::time::timeout(opts.timeout, child.wait()).await;

    let (exit_code, success, timed_out) = match waited {
        Ok(Ok(status)) => (status.code(), status.success(), false),
        Ok(Err(e)) => {
            warn!(program, error = %e, "failed to wait for process");
            (None, false, false)
        }
        Err(_) => {
            warn!(program, timeout_ms = opts.timeout.as_millis() as u64, "process timed out, killing");
            if let Err(e) = child.kill().await {
                warn!(program, error = %e, "failed to kill timed out process");
            }
            (None, false, true)
        }
    };

    let stdout = join_output(stdout_task).await;
    let stderr = join_output(stderr_task).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    debug!(program, success, timed_out, duration_ms, "process finished");

    ProcessOutput {
        success,
        stdout,
        stderr,
        timed_out,
        exit_code,
        duration_ms,
    }
}

async fn collect_lines<R>(reader: R, sink: Option<mpsc::UnboundedSender<String>>) -> String
where
    R: AsyncRead + Unpin,
{
    // TeX wraps lines at a byte width and can split a UTF-8 sequence. Read
    // bytes, decode lossily, and drain to EOF so the child never hits a
    // closed pipe.
    let mut out = String::new();
    let mut reader = BufReader::new(reader);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "error reading process output");
                break;
            }
        }
        let text = String::from_utf8_lossy(&raw);
        let line = text.strip_suffix('\n').unwrap_or(&text);
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(tx) = &sink {
            let _ = tx.send(line.to_string());
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

async fn join_output(task: Option<tokio::task::JoinHandle<String>>) -> String {
    match task {
        // A killed child closes its pipes, so the readers finish promptly.
        Some(handle) => match tokio::time::timeout(Duration::from_secs(5), handle).await {
            Ok(Ok(s)) => s,
            _ => String::new(),
        },
        None => String::new(),
    }
}

/// Keeps only the last `max_bytes` of `log`, cut on a char boundary.
pub fn tail(log: &str, max_bytes: usize) -> String {
    if log.len() <= max_bytes {
        return log.to_string();
    }
    let mut start = log.len() - max_bytes;
    while !log.is_char_boundary(start) {
        start += 1;
    }
    format!("[... truncated ...]\n{}", &log[start..])
}
