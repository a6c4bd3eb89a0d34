//! Domain Events
//!
//! Corruption events are immutable records of a block that failed
//! verification. They are handed to a [`CorruptionNotifier`] so an embedder
//! can surface them to userspace, an audit log or a monitoring pipeline.
//!
//! The [`Display`](std::fmt::Display) form is the uevent variable
//! `DM_VERITY_ERR_BLOCK_NR=<kind>,<block>` understood by existing tooling.
//!
//! [`CorruptionNotifier`]: super::ports::CorruptionNotifier

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name of the uevent variable carrying the failing block.
pub const UEVENT_ERR_BLOCK_NR: &str = "DM_VERITY_ERR_BLOCK_NR";

/// Which kind of block failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// A block on the data device
    Data = 0,
    /// A hash tree block on the hash device
    Metadata = 1,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Data => "data",
            BlockKind::Metadata => "metadata",
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A block failed verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorruptionEvent {
    /// Name of the data device
    pub device: String,
    pub kind: BlockKind,
    /// Data block index, or absolute hash device block for metadata
    pub block: u64,
    /// Value of the corruption counter after this event
    pub count: u32,
    pub timestamp: DateTime<Utc>,
}

impl CorruptionEvent {
    pub fn new(device: impl Into<String>, kind: BlockKind, block: u64, count: u32) -> Self {
        Self {
            device: device.into(),
            kind,
            block,
            count,
            timestamp: Utc::now(),
        }
    }

    /// The uevent environment entry for this event.
    pub fn uevent_var(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CorruptionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={},{}", UEVENT_ERR_BLOCK_NR, self.kind as u8, self.block)
    }
}
