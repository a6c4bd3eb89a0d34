//! BlockVerity - Transparent Block Integrity Verification
//!
//! Verifies every block read from a read-only data device against a Merkle
//! hash tree whose root digest is trusted, and optionally repairs corrupted
//! blocks with interleaved Reed-Solomon parity.
//!
//! # Architecture
//!
//! ```text
//! BlockRequest ─▶ VerityTarget ─▶ HashTreeVerifier ─▶ BufferedCache (hash device)
//!                     │                  │
//!                     │                  └──▶ FecDecoder ─▶ RsCodec
//!                     │                                 └─▶ BufferedCache (data, parity)
//!                     └──▶ ErrorPolicy ─▶ CorruptionNotifier / RestartHandler
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Block devices, notifiers and restart handlers
//! - [`builder`] - Hash tree and parity generation for images
//! - [`cache`] - Shared block cache with per-block verified bits
//! - [`config`] - Table line and file configuration
//! - [`device`] - Validated device geometry
//! - [`domain`] - Events and ports
//! - [`error`] - Error types
//! - [`fec`] - Forward error correction
//! - [`hash`] - Digest algorithms and salting
//! - [`metrics`] - Prometheus counters
//! - [`pipeline`] - Request admission and deferred verification
//! - [`policy`] - Corruption handling modes
//! - [`verifier`] - Hash tree walk

pub mod adapters;
pub mod builder;
pub mod cache;
pub mod config;
pub mod device;
pub mod domain;
pub mod error;
pub mod fec;
pub mod hash;
pub mod metrics;
pub mod pipeline;
pub mod policy;
pub mod verifier;

// Re-export commonly used types
pub use builder::{format_image, FormatOptions, FormattedImage};
pub use config::{FecConfig, VerityConfig};
pub use device::VerityDevice;
pub use error::{Error, Result};
pub use pipeline::{BlockRequest, IoBuffer, TargetDevices, TargetOptions, VerityTarget};
pub use policy::VerityMode;
pub use verifier::HashTreeVerifier;
