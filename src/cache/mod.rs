//! Buffered Block Cache
//!
//! Implements the `BlockCache` port over any `BlockDevice`.
//!
//! # Design
//!
//! - Entries live in a `DashMap` keyed by block index, so concurrent readers
//!   of different blocks never contend on one lock
//! - Each entry carries its own sticky verified bit; the bit dies with the
//!   entry on eviction
//! - Eviction is FIFO over insertion order once `capacity_blocks` is reached
//! - Two tasks that miss on the same block concurrently converge on a single
//!   entry, so a verified bit set by one is seen by the other

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::domain::{BlockCache, BlockDevice, CachedBlock};

/// Default number of cached blocks per device
pub const DEFAULT_CAPACITY_BLOCKS: usize = 8192;

/// Cache configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedCacheConfig {
    /// Maximum number of resident blocks (0 = unbounded)
    pub capacity_blocks: usize,
}

impl Default for BufferedCacheConfig {
    fn default() -> Self {
        Self {
            capacity_blocks: DEFAULT_CAPACITY_BLOCKS,
        }
    }
}

/// Point-in-time cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub resident: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Read-through block cache
pub struct BufferedCache {
    device: Arc<dyn BlockDevice>,
    block_size: usize,
    /// Byte offset of block 0 on the device
    base_offset: u64,
    config: BufferedCacheConfig,
    entries: DashMap<u64, CachedBlock>,
    order: Mutex<VecDeque<u64>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl std::fmt::Debug for BufferedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedCache")
            .field("block_size", &self.block_size)
            .field("base_offset", &self.base_offset)
            .field("stats", &self.stats())
            .finish()
    }
}

impl BufferedCache {
    pub fn new(device: Arc<dyn BlockDevice>, block_size: usize, config: BufferedCacheConfig) -> Self {
        Self::with_offset(device, block_size, 0, config)
    }

    /// Cache whose block 0 starts `base_offset` bytes into the device.
    pub fn with_offset(
        device: Arc<dyn BlockDevice>,
        block_size: usize,
        base_offset: u64,
        config: BufferedCacheConfig,
    ) -> Self {
        Self {
            device,
            block_size,
            base_offset,
            config,
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            resident: self.entries.len(),
        }
    }

    pub fn contains(&self, block: u64) -> bool {
        self.entries.contains_key(&block)
    }

    /// Drop one block, forgetting its verified bit.
    pub fn evict(&self, block: u64) -> bool {
        let mut order = self.order.lock();
        let removed = self.entries.remove(&block).is_some();
        if removed {
            order.retain(|&queued| queued != block);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Drop every block.
    pub fn evict_all(&self) {
        let resident = self.entries.len() as u64;
        self.entries.clear();
        self.order.lock().clear();
        self.evictions.fetch_add(resident, Ordering::Relaxed);
    }

    fn load(&self, block: u64) -> io::Result<CachedBlock> {
        let offset = block
            .checked_mul(self.block_size as u64)
            .and_then(|o| o.checked_add(self.base_offset))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "block offset overflow"))?;

        let mut buf = vec![0u8; self.block_size];
        self.device.read_at(offset, &mut buf)?;
        let loaded = CachedBlock::new(Bytes::from(buf));

        let (block_ref, inserted) = match self.entries.entry(block) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => (entry.insert(loaded).clone(), true),
        };

        if inserted && self.config.capacity_blocks > 0 {
            self.order.lock().push_back(block);
            self.shrink();
        }

        Ok(block_ref)
    }

    fn shrink(&self) {
        if self.config.capacity_blocks == 0 {
            return;
        }

        let mut order = self.order.lock();
        while self.entries.len() > self.config.capacity_blocks {
            let Some(victim) = order.pop_front() else {
                break;
            };
            if self.entries.remove(&victim).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                trace!(block = victim, "Evicted block");
            }
        }
    }
}

impl BlockCache for BufferedCache {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn device_blocks(&self) -> u64 {
        self.device.size_bytes().saturating_sub(self.base_offset) / self.block_size as u64
    }

    fn read(&self, block: u64) -> io::Result<CachedBlock> {
        if let Some(entry) = self.entries.get(&block) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(entry.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.load(block)
    }

    fn prefetch(&self, start: u64, count: u64) {
        let end = start.saturating_add(count).min(self.device_blocks());
        for block in start..end {
            if self.entries.contains_key(&block) {
                continue;
            }
            if let Err(e) = self.load(block) {
                trace!(block, error = %e, "Prefetch failed");
                break;
            }
        }
    }
}
