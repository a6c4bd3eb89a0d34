//! Request Buffers and Verification Context
//!
//! A read request carries its payload as a list of segments of arbitrary
//! lengths. Blocks may straddle segment boundaries, so everything that
//! touches the payload walks it through a [`BufferCursor`].

use std::io;

use crate::domain::BlockDevice;
use crate::error::{Error, Result};
use crate::fec::RecoveryContext;

/// Sector size of block requests
pub const SECTOR_SIZE: usize = 512;

/// Scatter/gather payload of a block request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoBuffer {
    segments: Vec<Vec<u8>>,
}

/// Position inside an [`IoBuffer`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferCursor {
    segment: usize,
    offset: usize,
}

impl IoBuffer {
    pub fn new(segments: Vec<Vec<u8>>) -> Self {
        Self { segments }
    }

    /// A single zeroed segment of `len` bytes.
    pub fn contiguous(len: usize) -> Self {
        Self::new(vec![vec![0u8; len]])
    }

    /// Zeroed segments of `segment_len` bytes (the last may be shorter).
    pub fn segmented(len: usize, segment_len: usize) -> Self {
        let segment_len = segment_len.max(1);
        let mut segments = Vec::with_capacity(len.div_ceil(segment_len));
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(segment_len);
            segments.push(vec![0u8; n]);
            remaining -= n;
        }
        Self::new(segments)
    }

    pub fn len(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn segments(&self) -> &[Vec<u8>] {
        &self.segments
    }

    /// Flatten into one contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.segments.concat()
    }

    /// Visit the next `len` bytes after `cursor` as mutable chunks, one per
    /// segment touched, advancing the cursor.
    pub fn for_each_chunk<F>(&mut self, cursor: &mut BufferCursor, len: usize, mut f: F) -> Result<()>
    where
        F: FnMut(&mut [u8]) -> Result<()>,
    {
        let mut remaining = len;
        while remaining > 0 {
            let segment = self
                .segments
                .get_mut(cursor.segment)
                .ok_or_else(|| Error::Internal("request buffer exhausted".into()))?;

            let available = segment.len() - cursor.offset;
            if available == 0 {
                cursor.segment += 1;
                cursor.offset = 0;
                continue;
            }

            let n = available.min(remaining);
            f(&mut segment[cursor.offset..cursor.offset + n])?;

            cursor.offset += n;
            if cursor.offset == segment.len() {
                cursor.segment += 1;
                cursor.offset = 0;
            }
            remaining -= n;
        }
        Ok(())
    }

    /// Fill every segment from `device`, starting at byte `offset`.
    pub fn read_from(&mut self, device: &dyn BlockDevice, offset: u64) -> io::Result<()> {
        let mut position = offset;
        for segment in &mut self.segments {
            device.read_at(position, segment)?;
            position += segment.len() as u64;
        }
        Ok(())
    }

    /// Copy `data` into the buffer at `cursor`.
    pub fn write_at_cursor(&mut self, cursor: &mut BufferCursor, data: &[u8]) -> Result<()> {
        let mut pos = 0;
        self.for_each_chunk(cursor, data.len(), |chunk| {
            chunk.copy_from_slice(&data[pos..pos + chunk.len()]);
            pos += chunk.len();
            Ok(())
        })
    }
}

impl From<Vec<u8>> for IoBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self::new(vec![data])
    }
}

/// Direction of a block request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// A block request addressed in 512-byte sectors
#[derive(Debug, Clone)]
pub struct BlockRequest {
    pub direction: Direction,
    pub sector: u64,
    pub buffer: IoBuffer,
}

impl BlockRequest {
    /// A read of `buffer.len()` bytes starting at `sector`.
    pub fn read(sector: u64, buffer: IoBuffer) -> Self {
        Self {
            direction: Direction::Read,
            sector,
            buffer,
        }
    }

    pub fn write(sector: u64, buffer: IoBuffer) -> Self {
        Self {
            direction: Direction::Write,
            sector,
            buffer,
        }
    }

    /// Request length in whole sectors.
    pub fn sectors(&self) -> u64 {
        (self.buffer.len() / SECTOR_SIZE) as u64
    }
}

/// Lifecycle of a verified read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoState {
    Received,
    Reading,
    Verifying,
    Complete,
    Failed,
}

/// Per-request verification state
///
/// Owns the digest scratch buffers, the payload cursor and the recovery
/// context, so concurrent requests never share mutable state.
#[derive(Debug)]
pub struct IoVerificationContext {
    /// First data block of the request
    pub block: u64,
    /// Number of data blocks in the request
    pub n_blocks: u64,
    pub(crate) real_digest: Vec<u8>,
    pub(crate) want_digest: Vec<u8>,
    pub(crate) cursor: BufferCursor,
    pub(crate) recovery: RecoveryContext,
    state: IoState,
}

impl IoVerificationContext {
    pub fn new(block: u64, n_blocks: u64, digest_size: usize) -> Self {
        Self {
            block,
            n_blocks,
            real_digest: vec![0u8; digest_size],
            want_digest: vec![0u8; digest_size],
            cursor: BufferCursor::default(),
            recovery: RecoveryContext::new(),
            state: IoState::Received,
        }
    }

    pub fn state(&self) -> IoState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: IoState) {
        tracing::trace!(block = self.block, from = ?self.state, to = ?state, "I/O state");
        self.state = state;
    }
}
