//! Best-effort build progress notifications.
//!
//! A [`ProgressSink`] receives percentages and must never block or fail the
//! build. Delivery is at most once.

use crate::error::{Result, TexdError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Percent reported once the job is admitted.
pub const PROGRESS_STARTED: u8 = 5;
/// Percent reported once sources are checked out.
pub const PROGRESS_CHECKED_OUT: u8 = 20;
/// Added for every latexmk rule run.
pub const PROGRESS_PER_RUN: u8 = 15;
/// Ceiling until the PDF is confirmed.
pub const PROGRESS_RUN_CAP: u8 = 90;
pub const PROGRESS_DONE: u8 = 100;

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound callback requested by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressCallback {
    pub url: String,
    /// Sent as `X-Compile-Secret`.
    #[serde(default)]
    pub secret: Option<String>,
}

impl ProgressCallback {
    pub fn validate(&self) -> Result<()> {
        let ok = (self.url.starts_with("https://") || self.url.starts_with("http://"))
            && self.url.len() <= crate::paths::MAX_GIT_URL_LEN
            && !self.url.chars().any(|c| c.is_whitespace() || c.is_control());
        if ok {
            Ok(())
        } else {
            Err(TexdError::invalid("progressCallback.url must be an http(s) URL"))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub paper_id: Option<String>,
    pub progress: u8,
}

/// Fire-and-forget notification target.
pub trait ProgressSink: Send + Sync {
    fn notify(&self, event: ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn notify(&self, _event: ProgressEvent) {}
}

/// POSTs each event as JSON on a detached task.
#[derive(Debug, Clone)]
pub struct HttpProgressSink {
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
}

impl HttpProgressSink {
    pub fn new(client: reqwest::Client, callback: &ProgressCallback) -> Self {
        Self {
            client,
            url: callback.url.clone(),
            secret: callback.secret.clone(),
        }
    }
}

impl ProgressSink for HttpProgressSink {
    fn notify(&self, event: ProgressEvent) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let mut request = self
            .client
            .post(&self.url)
            .timeout(CALLBACK_TIMEOUT)
            .json(&event);
        if let Some(secret) = &self.secret {
            request = request.header("X-Compile-Secret", secret);
        }
        let progress = event.progress;
        handle.spawn(async move {
            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(progress, "progress callback delivered");
                }
                Ok(resp) => warn!(progress, status = %resp.status(), "progress callback rejected"),
                Err(e) => warn!(progress, error = %e, "progress callback failed"),
            }
        });
    }
}

/// Turns build milestones and latexmk output into monotonically
/// increasing percentages.
pub struct ProgressTracker {
    sink: Arc<dyn ProgressSink>,
    paper_id: Option<String>,
    last: AtomicU8,
}

impl ProgressTracker {
    pub fn new(sink: Arc<dyn ProgressSink>, paper_id: Option<String>) -> Self {
        Self {
            sink,
            paper_id,
            last: AtomicU8::new(0),
        }
    }

    /// A tracker that reports nowhere.
    pub fn noop() -> Self {
        Self::new(Arc::new(NoopSink), None)
    }

    /// Sends `percent` if it is higher than anything sent before.
    pub fn report(&self, percent: u8) {
        let percent = percent.min(PROGRESS_DONE);
        let prev = self.last.fetch_max(percent, Ordering::SeqCst);
        if percent > prev {
            self.sink.notify(ProgressEvent {
                paper_id: self.paper_id.clone(),
                progress: percent,
            });
        }
    }

    /// Feeds one line of latexmk output.
    pub fn on_line(&self, line: &str) {
        if !line.contains("Run number") {
            return;
        }
        let current = self.last.load(Ordering::SeqCst).max(PROGRESS_CHECKED_OUT);
        let next = current.saturating_add(PROGRESS_PER_RUN).min(PROGRESS_RUN_CAP);
        self.report(next);
    }

    pub fn current(&self) -> u8 {
        self.last.load(Ordering::SeqCst)
    }
}
