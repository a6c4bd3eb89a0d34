//! Domain layer
//!
//! Events and the ports the verification engine is written against.

pub mod events;
pub mod ports;

pub use events::{BlockKind, CorruptionEvent};
pub use ports::{
    BlockCache, BlockDevice, CachedBlock, CorruptionNotifier, RestartHandler, VerifiedFlag,
};
