//! Verity Device Geometry
//!
//! [`VerityDevice`] is the immutable, validated form of a [`VerityConfig`].
//! It is built once when a target is opened and shared read-only by every
//! verification task afterwards.
//!
//! # Hash Tree Layout
//!
//! ```text
//! hash device:  | ... | level L-1 | level L-2 | ... | level 0 |
//!                     ^ hash_start                           ^ hash_blocks
//! ```
//!
//! Level 0 holds the digests of the data blocks. Every level above holds the
//! digests of the level below it. The single block of level `L-1` is
//! authenticated by the trusted root digest.

use std::sync::Arc;

use crate::config::{FecConfig, VerityConfig};
use crate::error::{Error, Result};
use crate::hash::{algorithm_by_name, VerityHasher};
use crate::policy::VerityMode;

// =============================================================================
// Constants
// =============================================================================

/// Sector size used by block requests
pub const SECTOR_SHIFT: u32 = 9;

/// Maximum depth of the hash tree
pub const MAX_LEVELS: usize = 63;

/// Total symbols in a Reed-Solomon codeword (the M of RS(M, N))
pub const FEC_RSM: usize = 255;

/// Smallest supported block size
pub const MIN_BLOCK_SIZE: u32 = 512;

/// Largest supported data block size (one page)
pub const MAX_DATA_BLOCK_SIZE: u32 = 4096;

// =============================================================================
// Tree Geometry
// =============================================================================

/// Arithmetic layout of a hash tree.
///
/// Shared by the verifier and by the image builder so both agree on where
/// every hash block lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeGeometry {
    /// log2 of the number of digest slots per hash block
    pub hash_per_block_bits: u32,

    /// Number of tree levels (0 for a single-block device)
    pub levels: usize,

    /// First hash block of every level, indexed by level (0 = leaves)
    pub level_start: Vec<u64>,

    /// One past the last hash block of the tree (absolute block index)
    pub hash_blocks: u64,
}

impl TreeGeometry {
    /// Compute the layout for `data_blocks` blocks.
    pub fn new(
        data_blocks: u64,
        hash_block_size: u32,
        digest_size: usize,
        hash_start: u64,
    ) -> Result<Self> {
        if digest_size == 0 || (hash_block_size as usize) < digest_size * 2 {
            return Err(Error::invalid("digest size", "digest size too big"));
        }

        let slots = hash_block_size as usize / digest_size;
        let hash_per_block_bits = usize::BITS - 1 - slots.leading_zeros();

        let mut levels = 0usize;
        if data_blocks > 0 {
            while (hash_per_block_bits as usize * levels) < 64
                && (data_blocks - 1) >> (hash_per_block_bits as usize * levels) != 0
            {
                levels += 1;
            }
        }

        if levels > MAX_LEVELS {
            return Err(Error::invalid("levels", "too many tree levels"));
        }

        let mut level_start = vec![0u64; levels];
        let mut position = hash_start;
        for level in (0..levels).rev() {
            level_start[level] = position;

            let shift = (level + 1) * hash_per_block_bits as usize;
            let blocks = if shift >= 64 {
                1
            } else {
                data_blocks.div_ceil(1u64 << shift)
            };

            position = position
                .checked_add(blocks)
                .ok_or_else(|| Error::invalid("hash start", "hash device offset overflow"))?;
        }

        Ok(Self {
            hash_per_block_bits,
            levels,
            level_start,
            hash_blocks: position,
        })
    }

    /// Number of hash blocks in `level`.
    pub fn level_blocks(&self, level: usize) -> u64 {
        let end = if level == 0 {
            self.hash_blocks
        } else {
            self.level_start[level - 1]
        };
        end - self.level_start[level]
    }
}

// =============================================================================
// FEC Parameters
// =============================================================================

/// Derived forward error correction parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecParams {
    /// Parity symbols per codeword (M - N)
    pub roots: u8,

    /// Data symbols per codeword (N)
    pub rsn: u8,

    /// Blocks covered by FEC
    pub blocks: u64,

    /// First parity block on the FEC device
    pub start: u64,

    /// Number of interleaving rounds: ceil(blocks / rsn)
    pub rounds: u64,

    /// Covered blocks that live on the hash device
    pub hash_blocks: u64,
}

impl FecParams {
    fn new(fec: &FecConfig, data_blocks: u64, tree_blocks: u64) -> Result<Self> {
        if fec.roots == 0 {
            return Err(Error::invalid("fec_roots", "missing fec_roots"));
        }
        if fec.roots as usize >= FEC_RSM {
            return Err(Error::invalid("fec_roots", fec.roots.to_string()));
        }

        let rsn = (FEC_RSM - fec.roots as usize) as u8;

        if fec.blocks == 0 {
            return Err(Error::invalid("fec_blocks", "missing fec_blocks"));
        }

        let rounds = fec.blocks.div_ceil(rsn as u64);

        // Trailing metadata may make fec_blocks larger than data + tree
        if fec.blocks < data_blocks + tree_blocks || rounds == 0 {
            return Err(Error::invalid(
                "fec_blocks",
                format!(
                    "{} blocks cannot cover {} data and {} hash blocks",
                    fec.blocks, data_blocks, tree_blocks
                ),
            ));
        }

        Ok(Self {
            roots: fec.roots,
            rsn,
            blocks: fec.blocks,
            start: fec.start,
            rounds,
            hash_blocks: fec.blocks - data_blocks,
        })
    }

    /// Number of blocks occupied by parity on the FEC device.
    pub fn parity_blocks(&self) -> u64 {
        self.rounds * self.roots as u64
    }
}

// =============================================================================
// Verity Device
// =============================================================================

/// Immutable per-device verification parameters
#[derive(Debug)]
pub struct VerityDevice {
    config: VerityConfig,
    name: String,
    version: u8,
    data_block_bits: u32,
    hash_block_bits: u32,
    data_blocks: u64,
    hash_start: u64,
    geometry: TreeGeometry,
    hasher: VerityHasher,
    root_digest: Vec<u8>,
    zero_digest: Option<Vec<u8>>,
    fec: Option<FecParams>,
    mode: VerityMode,
    data_start: u64,
    prefetch_cluster: u32,
}

impl VerityDevice {
    /// Validate a configuration and derive the device geometry.
    pub fn new(config: &VerityConfig) -> Result<Self> {
        if config.version > 1 {
            return Err(Error::invalid("version", config.version.to_string()));
        }

        let data_block_bits = block_bits(
            config.data_block_size,
            MAX_DATA_BLOCK_SIZE,
            "data device block size",
        )?;
        let hash_block_bits = block_bits(
            config.hash_block_size,
            i32::MAX as u32,
            "hash device block size",
        )?;

        let sectors_per_block = 1u64 << (data_block_bits - SECTOR_SHIFT);
        if config.data_blocks.checked_mul(sectors_per_block).is_none() {
            return Err(Error::invalid("data blocks", config.data_blocks.to_string()));
        }
        let hash_sectors = 1u64 << (hash_block_bits - SECTOR_SHIFT);
        if config.hash_start.checked_mul(hash_sectors).is_none() {
            return Err(Error::invalid("hash start", config.hash_start.to_string()));
        }

        let algorithm = algorithm_by_name(&config.algorithm)?;
        let digest_size = algorithm.digest_size();

        let root_digest = config.root_digest_bytes()?;
        if root_digest.len() != digest_size {
            return Err(Error::invalid(
                "root digest",
                format!("expected {} bytes, got {}", digest_size, root_digest.len()),
            ));
        }

        let salt = config.salt_bytes()?;
        let hasher = VerityHasher::new(algorithm, &salt, config.version);

        let geometry = TreeGeometry::new(
            config.data_blocks,
            config.hash_block_size,
            digest_size,
            config.hash_start,
        )?;

        let zero_digest = config
            .ignore_zero_blocks
            .then(|| hasher.digest(&vec![0u8; config.data_block_size as usize]));

        let fec = match &config.fec {
            Some(fec) => {
                if data_block_bits != hash_block_bits {
                    return Err(Error::invalid(
                        "fec",
                        "block sizes must match to use FEC",
                    ));
                }
                let tree_blocks = geometry.hash_blocks - config.hash_start;
                Some(FecParams::new(fec, config.data_blocks, tree_blocks)?)
            }
            None => None,
        };

        Ok(Self {
            config: config.clone(),
            name: config.data_device.clone(),
            version: config.version,
            data_block_bits,
            hash_block_bits,
            data_blocks: config.data_blocks,
            hash_start: config.hash_start,
            geometry,
            hasher,
            root_digest,
            zero_digest,
            fec,
            mode: config.mode,
            data_start: config.data_start,
            prefetch_cluster: config.prefetch_cluster,
        })
    }

    /// Convenience constructor returning a shared handle.
    pub fn shared(config: &VerityConfig) -> Result<Arc<Self>> {
        Self::new(config).map(Arc::new)
    }

    pub fn config(&self) -> &VerityConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn data_block_bits(&self) -> u32 {
        self.data_block_bits
    }

    pub fn data_block_size(&self) -> usize {
        1 << self.data_block_bits
    }

    pub fn hash_block_bits(&self) -> u32 {
        self.hash_block_bits
    }

    pub fn hash_block_size(&self) -> usize {
        1 << self.hash_block_bits
    }

    pub fn hash_per_block_bits(&self) -> u32 {
        self.geometry.hash_per_block_bits
    }

    pub fn data_blocks(&self) -> u64 {
        self.data_blocks
    }

    pub fn hash_start(&self) -> u64 {
        self.hash_start
    }

    /// One past the last hash block of the tree
    pub fn hash_blocks(&self) -> u64 {
        self.geometry.hash_blocks
    }

    pub fn levels(&self) -> usize {
        self.geometry.levels
    }

    pub fn geometry(&self) -> &TreeGeometry {
        &self.geometry
    }

    pub fn level_start(&self, level: usize) -> u64 {
        self.geometry.level_start[level]
    }

    pub fn hasher(&self) -> &VerityHasher {
        &self.hasher
    }

    pub fn digest_size(&self) -> usize {
        self.hasher.digest_size()
    }

    pub fn root_digest(&self) -> &[u8] {
        &self.root_digest
    }

    pub fn zero_digest(&self) -> Option<&[u8]> {
        self.zero_digest.as_deref()
    }

    pub fn fec(&self) -> Option<&FecParams> {
        self.fec.as_ref()
    }

    pub fn mode(&self) -> VerityMode {
        self.mode
    }

    pub fn data_start(&self) -> u64 {
        self.data_start
    }

    pub fn prefetch_cluster(&self) -> u32 {
        self.prefetch_cluster
    }

    /// Translate a target-relative sector to a sector on the data device.
    pub fn map_sector(&self, sector: u64) -> u64 {
        self.data_start + sector
    }

    /// Position of `block`'s digest at `level`. The low `hash_per_block_bits`
    /// bits select the slot inside a hash block, the rest select the block.
    #[inline]
    pub fn position_at_level(&self, block: u64, level: usize) -> u64 {
        let shift = level * self.geometry.hash_per_block_bits as usize;
        if shift >= 64 {
            0
        } else {
            block >> shift
        }
    }

    /// Hash block index and byte offset of `block`'s digest at `level`.
    pub fn hash_block_at_level(&self, block: u64, level: usize) -> (u64, usize) {
        let bits = self.geometry.hash_per_block_bits;
        let position = self.position_at_level(block, level);
        let hash_block = self.geometry.level_start[level] + (position >> bits);

        let idx = (position & ((1u64 << bits) - 1)) as usize;
        let offset = slot_offset(
            self.version,
            idx,
            self.digest_size(),
            self.hash_block_bits,
            bits,
        );

        (hash_block, offset)
    }
}

/// Byte offset of digest slot `idx` inside a hash block.
///
/// Version 0 packs digests back to back; later versions pad every digest to
/// a power-of-two slot.
pub fn slot_offset(
    version: u8,
    idx: usize,
    digest_size: usize,
    hash_block_bits: u32,
    hash_per_block_bits: u32,
) -> usize {
    if version == 0 {
        idx * digest_size
    } else {
        idx << (hash_block_bits - hash_per_block_bits)
    }
}

pub(crate) fn block_bits(size: u32, max: u32, what: &str) -> Result<u32> {
    if size < MIN_BLOCK_SIZE || !size.is_power_of_two() || size > max {
        return Err(Error::invalid(what, size.to_string()));
    }
    Ok(size.trailing_zeros())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(data_blocks: u64) -> VerityConfig {
        VerityConfig {
            version: 1,
            data_device: "data".into(),
            hash_device: "hash".into(),
            data_block_size: 4096,
            hash_block_size: 4096,
            data_blocks,
            hash_start: 0,
            algorithm: "sha256".into(),
            root_digest: "00".repeat(32),
            salt: "-".into(),
            mode: VerityMode::FailIo,
            ignore_zero_blocks: false,
            fec: None,
            data_start: 0,
            prefetch_cluster: 262_144,
        }
    }

    #[test]
    fn test_single_level_geometry() {
        let device = VerityDevice::new(&config(16)).unwrap();
        assert_eq!(device.hash_per_block_bits(), 7);
        assert_eq!(device.levels(), 1);
        assert_eq!(device.level_start(0), 0);
        assert_eq!(device.hash_blocks(), 1);
    }

    #[test]
    fn test_multi_level_geometry() {
        // 128 digests per block: 129 blocks need two leaf blocks and a root block
        let mut cfg = config(129);
        cfg.hash_start = 3;
        let device = VerityDevice::new(&cfg).unwrap();

        assert_eq!(device.levels(), 2);
        assert_eq!(device.level_start(1), 3);
        assert_eq!(device.level_start(0), 4);
        assert_eq!(device.hash_blocks(), 6);
        assert_eq!(device.geometry().level_blocks(0), 2);
        assert_eq!(device.geometry().level_blocks(1), 1);
    }

    #[test]
    fn test_single_block_has_no_levels() {
        let device = VerityDevice::new(&config(1)).unwrap();
        assert_eq!(device.levels(), 0);
        assert_eq!(device.hash_blocks(), 0);
    }

    #[test]
    fn test_hash_block_at_level() {
        let device = VerityDevice::new(&config(129)).unwrap();

        // Block 128 is the first slot of the second leaf block
        let (hash_block, offset) = device.hash_block_at_level(128, 0);
        assert_eq!(hash_block, device.level_start(0) + 1);
        assert_eq!(offset, 0);

        // Version 1 pads 32-byte digests to 32-byte slots
        let (hash_block, offset) = device.hash_block_at_level(5, 0);
        assert_eq!(hash_block, device.level_start(0));
        assert_eq!(offset, 5 * 32);

        // At level 1 block 128 maps to slot 1 of the root block
        let (hash_block, offset) = device.hash_block_at_level(128, 1);
        assert_eq!(hash_block, device.level_start(1));
        assert_eq!(offset, 32);
    }

    #[test]
    fn test_slot_offset_versions() {
        // sha256 in 4096-byte blocks: 128 slots of 32 bytes either way
        assert_eq!(slot_offset(0, 3, 32, 12, 7), 96);
        assert_eq!(slot_offset(1, 3, 32, 12, 7), 96);
        // 24-byte digests: version 0 packs, version 1 pads to 32 bytes
        assert_eq!(slot_offset(0, 3, 24, 12, 7), 72);
        assert_eq!(slot_offset(1, 3, 24, 12, 7), 96);
    }

    #[test]
    fn test_zero_digest() {
        let mut cfg = config(16);
        cfg.ignore_zero_blocks = true;
        let device = VerityDevice::new(&cfg).unwrap();
        let expected = device.hasher().digest(&[0u8; 4096]);
        assert_eq!(device.zero_digest(), Some(expected.as_slice()));
    }

    #[test]
    fn test_invalid_block_sizes() {
        for size in [0, 256, 1000, 8192] {
            let mut cfg = config(16);
            cfg.data_block_size = size;
            assert!(VerityDevice::new(&cfg).is_err(), "{size}");
        }
    }

    #[test]
    fn test_digest_too_big_for_hash_block() {
        let mut cfg = config(16);
        cfg.algorithm = "sha512".into();
        cfg.root_digest = "00".repeat(64);
        cfg.hash_block_size = 512;
        assert!(VerityDevice::new(&cfg).is_ok());

        cfg.data_block_size = 512;
        cfg.hash_block_size = 64;
        assert!(VerityDevice::new(&cfg).is_err());
    }

    #[test]
    fn test_root_digest_length_checked() {
        let mut cfg = config(16);
        cfg.root_digest = "00".repeat(20);
        assert!(VerityDevice::new(&cfg).is_err());
    }

    #[test]
    fn test_fec_params() {
        let mut cfg = config(16);
        cfg.fec = Some(FecConfig {
            device: "fec".into(),
            blocks: 17,
            start: 0,
            roots: 2,
        });
        let device = VerityDevice::new(&cfg).unwrap();
        let fec = device.fec().unwrap();
        assert_eq!(fec.rsn, 253);
        assert_eq!(fec.rounds, 1);
        assert_eq!(fec.hash_blocks, 1);
        assert_eq!(fec.parity_blocks(), 2);
    }

    #[test]
    fn test_fec_validation() {
        let mut cfg = config(16);
        cfg.fec = Some(FecConfig {
            device: "fec".into(),
            blocks: 16,
            start: 0,
            roots: 2,
        });
        // Does not cover the hash block
        assert!(VerityDevice::new(&cfg).is_err());

        cfg.fec = Some(FecConfig {
            device: "fec".into(),
            blocks: 17,
            start: 0,
            roots: 0,
        });
        assert!(VerityDevice::new(&cfg).is_err());

        cfg.fec = Some(FecConfig {
            device: "fec".into(),
            blocks: 17,
            start: 0,
            roots: 2,
        });
        cfg.hash_block_size = 1024;
        assert!(VerityDevice::new(&cfg).is_err());
    }
}
