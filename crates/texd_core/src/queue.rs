//! Bounded admission gate for compilation jobs.

use crate::error::{Result, TexdError};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, TryAcquireError};
use tracing::{debug, info};

/// Snapshot of queue occupancy.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub running: usize,
    pub queued: usize,
    pub capacity: usize,
    pub max_depth: usize,
}

/// Runs at most `capacity` jobs at once with up to `max_depth` waiting.
///
/// Anything beyond that is rejected immediately with
/// [`TexdError::QueueFull`]. [`CompileQueue::close`] rejects every waiter
/// and all later submissions with [`TexdError::ShuttingDown`]; running jobs
/// are left to finish.
#[derive(Debug)]
pub struct CompileQueue {
    slots: Arc<Semaphore>,
    capacity: usize,
    max_depth: usize,
    queued: AtomicUsize,
}

/// Decrements the waiting count when a waiter leaves, however it leaves.
struct Waiting<'a>(&'a AtomicUsize);

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl CompileQueue {
    pub fn new(capacity: usize, max_depth: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            max_depth,
            queued: AtomicUsize::new(0),
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            running: self.capacity.saturating_sub(self.slots.available_permits()),
            queued: self.queued.load(Ordering::SeqCst),
            capacity: self.capacity,
            max_depth: self.max_depth,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }

    /// Runs `job` once a slot is free.
    pub async fn run<F, Fut, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(TexdError::ShuttingDown),
            Err(TryAcquireError::NoPermits) => {
                let reserved = self
                    .queued
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |q| {
                        (q < self.max_depth).then_some(q + 1)
                    });
                if reserved.is_err() {
                    let stats = self.stats();
                    debug!(running = stats.running, queued = stats.queued, "queue full");
                    return Err(TexdError::QueueFull {
                        running: stats.running,
                        queued: stats.queued,
                    });
                }
                let waiting = Waiting(&self.queued);
                let acquired = Arc::clone(&self.slots).acquire_owned().await;
                drop(waiting);
                acquired.map_err(|_| TexdError::ShuttingDown)?
            }
        };

        let out = job().await;
        drop(permit);
        out
    }

    /// Stops admitting work and rejects everything still waiting.
    pub fn close(&self) {
        if !self.slots.is_closed() {
            let queued = self.queued.load(Ordering::SeqCst);
            info!(queued, "closing compile queue");
            self.slots.close();
        }
    }

    /// Waits until no job is running, or `timeout` elapses. Returns whether
    /// the queue went idle.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.stats().running == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
