//! Corruption Handling Policy
//!
//! Decides what happens when a block fails verification and cannot be
//! recovered:
//!
//! | Mode      | Request        | Side effect                     |
//! |-----------|----------------|---------------------------------|
//! | `FailIo`  | fails with EIO | -                               |
//! | `LogOnly` | continues      | -                               |
//! | `Restart` | fails with EIO | [`RestartHandler::restart`]     |
//!
//! In every mode the device is marked as having seen a hash failure and the
//! first [`MAX_CORRUPTED_ERRS`] failures are logged and sent to the
//! [`CorruptionNotifier`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::domain::{BlockKind, CorruptionEvent, CorruptionNotifier, RestartHandler};
use crate::metrics::VerityMetrics;

/// Failures logged and notified before the device goes quiet.
pub const MAX_CORRUPTED_ERRS: u32 = 100;

/// Reaction to an unrecoverable verification failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerityMode {
    /// Fail the request with an I/O error
    #[default]
    FailIo,
    /// Log the failure and return the data anyway
    LogOnly,
    /// Restart the host, then fail the request
    Restart,
}

impl VerityMode {
    /// Feature argument naming this mode, if it is not the default.
    pub fn feature_arg(&self) -> Option<&'static str> {
        match self {
            VerityMode::FailIo => None,
            VerityMode::LogOnly => Some(crate::config::OPT_IGNORE_CORRUPTION),
            VerityMode::Restart => Some(crate::config::OPT_RESTART_ON_CORRUPTION),
        }
    }
}

impl fmt::Display for VerityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VerityMode::FailIo => "fail_io",
            VerityMode::LogOnly => "log_only",
            VerityMode::Restart => "restart",
        };
        f.write_str(name)
    }
}

/// Per-device corruption state and mode dispatch
pub struct ErrorPolicy {
    device: String,
    mode: VerityMode,
    hash_failed: AtomicBool,
    corrupted_errs: AtomicU32,
    notifier: Arc<dyn CorruptionNotifier>,
    restart: Arc<dyn RestartHandler>,
    metrics: Arc<VerityMetrics>,
}

impl fmt::Debug for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorPolicy")
            .field("device", &self.device)
            .field("mode", &self.mode)
            .field("hash_failed", &self.hash_failed())
            .field("corrupted_errs", &self.corrupted_errs())
            .finish()
    }
}

impl ErrorPolicy {
    pub fn new(
        device: impl Into<String>,
        mode: VerityMode,
        notifier: Arc<dyn CorruptionNotifier>,
        restart: Arc<dyn RestartHandler>,
        metrics: Arc<VerityMetrics>,
    ) -> Self {
        Self {
            device: device.into(),
            mode,
            hash_failed: AtomicBool::new(false),
            corrupted_errs: AtomicU32::new(0),
            notifier,
            restart,
            metrics,
        }
    }

    pub fn mode(&self) -> VerityMode {
        self.mode
    }

    /// Record an unrecoverable failure of `block`.
    ///
    /// Returns true when the request must fail, false when it may continue.
    pub fn handle(&self, kind: BlockKind, block: u64) -> bool {
        self.hash_failed.store(true, Ordering::Release);
        self.metrics.record_corruption(kind);

        let counted = self
            .corrupted_errs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < MAX_CORRUPTED_ERRS).then_some(n + 1)
            });

        if let Ok(previous) = counted {
            let count = previous + 1;
            error!(
                device = %self.device,
                kind = %kind,
                block,
                "{} block {} is corrupted",
                kind,
                block
            );
            if count == MAX_CORRUPTED_ERRS {
                error!(device = %self.device, "reached maximum errors");
            }
            self.notifier
                .notify(&CorruptionEvent::new(&self.device, kind, block, count));
        }

        match self.mode {
            VerityMode::LogOnly => false,
            VerityMode::Restart => {
                self.restart
                    .restart(&format!("{} device corrupted", self.device));
                true
            }
            VerityMode::FailIo => true,
        }
    }

    /// True once any block has failed verification.
    pub fn hash_failed(&self) -> bool {
        self.hash_failed.load(Ordering::Acquire)
    }

    /// Number of failures logged so far, saturating at [`MAX_CORRUPTED_ERRS`].
    pub fn corrupted_errs(&self) -> u32 {
        self.corrupted_errs.load(Ordering::Acquire)
    }

    /// Status character: `V` while clean, `C` after any failure.
    pub fn status_char(&self) -> char {
        if self.hash_failed() {
            'C'
        } else {
            'V'
        }
    }
}
