//! Restart Handler Adapters

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::error;

use crate::domain::RestartHandler;

/// Aborts the process.
///
/// The closest userspace equivalent of an emergency reboot: no destructors
/// run and nothing is flushed.
#[derive(Debug, Clone, Default)]
pub struct AbortRestart;

impl RestartHandler for AbortRestart {
    fn restart(&self, reason: &str) {
        error!(reason, "Restarting after unrecoverable corruption");
        std::process::abort();
    }
}

/// Records restart requests instead of acting on them.
#[derive(Debug, Default)]
pub struct RecordingRestart {
    count: AtomicUsize,
    last_reason: Mutex<Option<String>>,
}

impl RecordingRestart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn last_reason(&self) -> Option<String> {
        self.last_reason.lock().clone()
    }
}

impl RestartHandler for RecordingRestart {
    fn restart(&self, reason: &str) {
        error!(reason, "Restart requested");
        *self.last_reason.lock() = Some(reason.to_string());
        self.count.fetch_add(1, Ordering::AcqRel);
    }
}
