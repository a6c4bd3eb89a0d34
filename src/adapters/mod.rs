//! Infrastructure Adapters
//!
//! Concrete implementations of the domain ports.
//!
//! # Available Adapters
//!
//! ## Block devices
//! - [`FileDevice`]: files and block special files
//! - [`MemoryDevice`]: byte buffers with fault injection
//!
//! ## Corruption notifiers
//! - [`LoggingNotifier`]: tracing output
//! - [`InMemoryNotifier`]: collects events for inspection
//! - [`ChannelNotifier`]: forwards to a tokio channel
//! - [`CompositeNotifier`]: fans out to several notifiers
//!
//! ## Restart handlers
//! - [`AbortRestart`]: aborts the process
//! - [`RecordingRestart`]: counts requests

pub mod block_device;
pub mod notifier;
pub mod restart;

pub use block_device::{FileDevice, MemoryDevice};
pub use notifier::{ChannelNotifier, CompositeNotifier, InMemoryNotifier, LoggingNotifier};
pub use restart::{AbortRestart, RecordingRestart};
