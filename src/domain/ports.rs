//! Domain Ports (Port/Adapter Pattern)
//!
//! The verification engine depends only on the traits below. Adapters in
//! [`crate::adapters`] and [`crate::cache`] provide concrete implementations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Verification Engine                      │
//! │   VerityTarget ─► HashTreeVerifier ─► FecDecoder             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Ports (Traits)                       │
//! │  BlockDevice │ BlockCache │ CorruptionNotifier │ Restart...  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Adapters (Impls)                      │
//! │  FileDevice │ MemoryDevice │ BufferedCache │ LoggingNotifier │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use super::events::CorruptionEvent;

// =============================================================================
// Block Device
// =============================================================================

/// Random-access, read-only view of an underlying device.
///
/// Implementations must be safe to call from many verification workers at
/// once.
pub trait BlockDevice: Send + Sync + fmt::Debug {
    /// Fill `buf` from byte `offset`. Short reads are errors.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Device size in bytes.
    fn size_bytes(&self) -> u64;

    /// Device size in whole blocks of `block_size` bytes.
    fn size_blocks(&self, block_size: usize) -> u64 {
        self.size_bytes() / block_size as u64
    }
}

// =============================================================================
// Block Cache
// =============================================================================

/// Sticky per-buffer "verified" bit.
///
/// Once set, it stays set for as long as the buffer stays cached. It is
/// never cleared; eviction drops the buffer and the bit with it.
#[derive(Debug, Clone, Default)]
pub struct VerifiedFlag(Arc<AtomicBool>);

impl VerifiedFlag {
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// A block handed out by a [`BlockCache`].
///
/// Cloning is cheap; clones share the underlying bytes and the verified bit.
#[derive(Debug, Clone)]
pub struct CachedBlock {
    pub data: Bytes,
    pub verified: VerifiedFlag,
}

impl CachedBlock {
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            verified: VerifiedFlag::default(),
        }
    }
}

/// Fixed-block-size read cache over a [`BlockDevice`].
pub trait BlockCache: Send + Sync + fmt::Debug {
    /// Block size in bytes.
    fn block_size(&self) -> usize;

    /// Number of whole blocks on the underlying device.
    fn device_blocks(&self) -> u64;

    /// Read a block, loading it from the device on a miss.
    fn read(&self, block: u64) -> io::Result<CachedBlock>;

    /// Hint that `count` blocks starting at `start` will be read soon.
    ///
    /// Errors are swallowed; a failed prefetch surfaces on the real read.
    fn prefetch(&self, start: u64, count: u64);
}

// =============================================================================
// Notification & Restart
// =============================================================================

/// Receives corruption events.
///
/// Called on the verification path, so implementations must not block.
pub trait CorruptionNotifier: Send + Sync {
    fn notify(&self, event: &CorruptionEvent);
}

/// Reboots or otherwise restarts the host when a device runs in restart mode.
pub trait RestartHandler: Send + Sync {
    fn restart(&self, reason: &str);
}
