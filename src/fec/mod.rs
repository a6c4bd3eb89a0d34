//! Forward Error Correction
//!
//! Interleaved Reed-Solomon recovery of blocks that fail verification.
//!
//! # Interleaving
//!
//! The covered region (data blocks, then hash device blocks) is split into
//! `rounds = ceil(blocks / rsn)` rounds. Round `r` is made of the blocks
//! `r, r + rounds, r + 2*rounds, ...`, so one physical failure spreads over
//! many codewords, at most one symbol per codeword per bad block.
//!
//! ```text
//!              block r    block r+rounds   ...   block r+(rsn-1)*rounds   parity
//! codeword 0 : byte 0     byte 0                 byte 0                   roots bytes
//! codeword 1 : byte 1     byte 1                 byte 1                   roots bytes
//! ...
//! ```
//!
//! Parity for codeword `r * block_size + j` lives at byte
//! `(r * block_size + j) * roots` of the parity area.

use std::collections::HashSet;

pub mod codec;
pub mod decoder;
pub mod encoder;

#[cfg(test)]
mod proptest;

pub use codec::{RsCodec, RsError, GF_ORDER};
pub use decoder::{FecCaches, FecDecoder};
pub use encoder::FecEncoder;

/// Maximum nesting of recoveries triggered while recovering a block.
pub const MAX_RECURSION: u8 = 4;

/// Deinterleaved buffers for one round.
#[derive(Debug, Default)]
pub(crate) struct FecScratch {
    /// `rsn * block_size` bytes, symbol `i` of codeword `j` at `j * rsn + i`.
    /// After a successful decode the recovered block occupies the first
    /// `block_size` bytes.
    pub(crate) buf: Vec<u8>,
    /// Codeword positions known to be bad
    pub(crate) erasures: Vec<usize>,
}

/// Per-request recovery state.
///
/// Tracks recursion depth and recycles scratch buffers so that nested
/// recoveries never share a buffer. Hash blocks whose recovery is running
/// or has failed are remembered, so one request attempts each of them once.
#[derive(Debug, Default)]
pub struct RecoveryContext {
    depth: u8,
    pool: Vec<FecScratch>,
    attempted_metadata: HashSet<u64>,
}

impl RecoveryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current recovery nesting depth.
    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub(crate) fn enter(&mut self) -> bool {
        if self.depth >= MAX_RECURSION {
            return false;
        }
        self.depth += 1;
        true
    }

    pub(crate) fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Claim the recovery of hash block `block` for this request. Returns
    /// false when it is already running or has failed.
    pub(crate) fn begin_metadata(&mut self, block: u64) -> bool {
        self.attempted_metadata.insert(block)
    }

    /// The recovery of `block` succeeded.
    pub(crate) fn finish_metadata(&mut self, block: u64) {
        self.attempted_metadata.remove(&block);
    }

    pub(crate) fn take_scratch(&mut self, len: usize) -> FecScratch {
        let mut scratch = self.pool.pop().unwrap_or_default();
        scratch.buf.clear();
        scratch.buf.resize(len, 0);
        scratch.erasures.clear();
        scratch
    }

    pub(crate) fn release_scratch(&mut self, scratch: FecScratch) {
        if self.pool.len() < MAX_RECURSION as usize {
            self.pool.push(scratch);
        }
    }
}

/// Source of one interleaved block of the covered region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegionBlock {
    /// Data device block
    Data(u64),
    /// Absolute hash device block
    Hash(u64),
    /// Past the end of the region; contributes zeros
    Padding,
}

/// Map an index in the covered region to the device block backing it.
pub(crate) fn region_source(
    region_block: u64,
    data_blocks: u64,
    hash_start: u64,
    fec_hash_blocks: u64,
) -> RegionBlock {
    if region_block < data_blocks {
        return RegionBlock::Data(region_block);
    }
    let offset = region_block - data_blocks;
    if offset < fec_hash_blocks {
        RegionBlock::Hash(hash_start + offset)
    } else {
        RegionBlock::Padding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_source() {
        assert_eq!(region_source(3, 16, 2, 1), RegionBlock::Data(3));
        assert_eq!(region_source(16, 16, 2, 1), RegionBlock::Hash(2));
        assert_eq!(region_source(17, 16, 2, 1), RegionBlock::Padding);
    }

    #[test]
    fn test_recursion_limit() {
        let mut ctx = RecoveryContext::new();
        for _ in 0..MAX_RECURSION {
            assert!(ctx.enter());
        }
        assert!(!ctx.enter());
        ctx.leave();
        assert!(ctx.enter());
    }

    #[test]
    fn test_metadata_recovery_claimed_once() {
        let mut ctx = RecoveryContext::new();
        assert!(ctx.begin_metadata(7));
        assert!(!ctx.begin_metadata(7));
        assert!(ctx.begin_metadata(8));

        ctx.finish_metadata(7);
        assert!(ctx.begin_metadata(7));
    }

    #[test]
    fn test_scratch_is_recycled_zeroed() {
        let mut ctx = RecoveryContext::new();
        let mut scratch = ctx.take_scratch(16);
        scratch.buf[3] = 9;
        scratch.erasures.push(1);
        ctx.release_scratch(scratch);

        let scratch = ctx.take_scratch(8);
        assert_eq!(scratch.buf, vec![0u8; 8]);
        assert!(scratch.erasures.is_empty());
    }
}
