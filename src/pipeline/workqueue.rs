//! Verification Worker Queue
//!
//! Hashing is CPU bound, so verification and prefetch jobs run on tokio's
//! blocking pool. A [`TaskTracker`] remembers every job so shutdown can wait
//! for all of them.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::error::{Error, Result};

/// Tracked pool of blocking verification jobs
#[derive(Debug)]
pub struct VerifyQueue {
    name: String,
    tracker: TaskTracker,
    submitted: AtomicU64,
}

impl VerifyQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tracker: TaskTracker::new(),
            submitted: AtomicU64::new(0),
        }
    }

    /// Run `job` on the blocking pool. Fails once the queue is draining.
    pub fn spawn<F, R>(&self, job: F) -> Result<JoinHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.tracker.is_closed() {
            return Err(Error::Internal(format!("{} queue is shut down", self.name)));
        }
        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(self.tracker.spawn_blocking(job))
    }

    /// Jobs queued or running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Jobs accepted since creation.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Refuse new jobs and wait for the queued ones to finish.
    pub async fn drain(&self) {
        self.tracker.close();
        debug!(queue = %self.name, in_flight = self.in_flight(), "Draining queue");
        self.tracker.wait().await;
    }
}
