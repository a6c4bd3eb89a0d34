//! Corruption Notifier Adapters
//!
//! Implements the `CorruptionNotifier` port with various backends.

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::{CorruptionEvent, CorruptionNotifier};

/// Logging-based notifier.
///
/// Emits every event through `tracing` together with its uevent string.
#[derive(Debug, Clone, Default)]
pub struct LoggingNotifier;

impl LoggingNotifier {
    pub fn new() -> Self {
        Self
    }
}

impl CorruptionNotifier for LoggingNotifier {
    fn notify(&self, event: &CorruptionEvent) {
        let json = serde_json::to_string(event).unwrap_or_else(|_| format!("{:?}", event));
        warn!(uevent = %event, event = %json, "Corruption event");
    }
}

/// In-memory event collector for testing.
#[derive(Debug, Default)]
pub struct InMemoryNotifier {
    events: RwLock<Vec<CorruptionEvent>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// All collected events.
    pub fn events(&self) -> Vec<CorruptionEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl CorruptionNotifier for InMemoryNotifier {
    fn notify(&self, event: &CorruptionEvent) {
        self.events.write().push(event.clone());
    }
}

/// Forwards events to an async consumer.
///
/// Sending never blocks the verification path; events are dropped once the
/// receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<CorruptionEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CorruptionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl CorruptionNotifier for ChannelNotifier {
    fn notify(&self, event: &CorruptionEvent) {
        if self.tx.send(event.clone()).is_err() {
            debug!(uevent = %event, "Notification receiver closed");
        }
    }
}

/// Fans an event out to several notifiers.
#[derive(Default)]
pub struct CompositeNotifier {
    notifiers: Vec<Box<dyn CorruptionNotifier>>,
}

impl CompositeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_notifier<N: CorruptionNotifier + 'static>(mut self, notifier: N) -> Self {
        self.notifiers.push(Box::new(notifier));
        self
    }
}

impl std::fmt::Debug for CompositeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeNotifier")
            .field("notifier_count", &self.notifiers.len())
            .finish()
    }
}

impl CorruptionNotifier for CompositeNotifier {
    fn notify(&self, event: &CorruptionEvent) {
        for notifier in &self.notifiers {
            notifier.notify(event);
        }
    }
}
