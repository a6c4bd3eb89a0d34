//! Hash Tree Verifier
//!
//! Resolves the expected digest of a data block by walking the hash tree
//! from the trusted root down to level 0.
//!
//! # Walk
//!
//! ```text
//! 1. fast path: level-0 hash block cached and verified?  ──yes──► digest
//!                                │ no
//!                                ▼
//! 2. want = root digest
//!    for level in L-1 ..= 0:
//!        read hash block, check digest == want (or trust verified bit)
//!        want = digest slot for this block
//! ```
//!
//! A hash block whose digest does not match is handed to FEC when
//! configured, then to the error policy.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, trace};

use crate::device::VerityDevice;
use crate::domain::{BlockCache, BlockKind};
use crate::error::{Error, Result};
use crate::fec::{FecDecoder, RecoveryContext};
use crate::metrics::VerityMetrics;
use crate::policy::ErrorPolicy;

/// Result of checking one level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelOutcome {
    /// The child digest was written to `want`
    Resolved,
    /// The hash block was not verified yet and the caller asked to skip it
    Inconclusive,
}

/// Expected digest of a data block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDigest {
    pub digest: Vec<u8>,
    /// The digest equals the digest of an all-zero block
    pub is_zero: bool,
}

/// Authenticates hash blocks against the trusted root
#[derive(Debug)]
pub struct HashTreeVerifier {
    device: Arc<VerityDevice>,
    hash_cache: Arc<dyn BlockCache>,
    policy: Arc<ErrorPolicy>,
    metrics: Arc<VerityMetrics>,
    fec: Option<FecDecoder>,
    /// Hash blocks rebuilt by FEC, keyed by hash device block
    recovered: DashMap<u64, Bytes>,
}

impl HashTreeVerifier {
    pub fn new(
        device: Arc<VerityDevice>,
        hash_cache: Arc<dyn BlockCache>,
        policy: Arc<ErrorPolicy>,
        metrics: Arc<VerityMetrics>,
    ) -> Self {
        Self {
            device,
            hash_cache,
            policy,
            metrics,
            fec: None,
            recovered: DashMap::new(),
        }
    }

    /// Recover corrupted blocks with `fec` before declaring them corrupt.
    pub fn with_fec(mut self, fec: FecDecoder) -> Self {
        self.fec = Some(fec);
        self
    }

    pub fn device(&self) -> &Arc<VerityDevice> {
        &self.device
    }

    pub fn hash_cache(&self) -> &Arc<dyn BlockCache> {
        &self.hash_cache
    }

    pub fn policy(&self) -> &Arc<ErrorPolicy> {
        &self.policy
    }

    pub fn metrics(&self) -> &Arc<VerityMetrics> {
        &self.metrics
    }

    pub fn fec(&self) -> Option<&FecDecoder> {
        self.fec.as_ref()
    }

    /// Number of hash blocks currently served from FEC recoveries.
    pub fn recovered_blocks(&self) -> usize {
        self.recovered.len()
    }

    /// FEC-recovered contents of hash device block `block`, if any.
    pub(crate) fn recovered_block(&self, block: u64) -> Option<Bytes> {
        self.recovered.get(&block).map(|entry| entry.value().clone())
    }

    /// Drop FEC-recovered hash blocks so they are read from the device again.
    pub fn forget_recovered(&self) {
        self.recovered.clear();
    }

    /// Position of `block`'s digest at `level`.
    pub fn position_at_level(&self, block: u64, level: usize) -> u64 {
        self.device.position_at_level(block, level)
    }

    /// Hash block and byte offset holding `block`'s digest at `level`.
    pub fn locate(&self, block: u64, level: usize) -> (u64, usize) {
        self.device.hash_block_at_level(block, level)
    }

    /// Check the hash block covering `block` at `level` against `want`, then
    /// replace `want` with the digest it stores for `block`.
    ///
    /// With `skip_unverified`, a hash block not yet marked verified is left
    /// alone and [`LevelOutcome::Inconclusive`] is returned.
    pub fn verify_level(
        &self,
        ctx: &mut RecoveryContext,
        block: u64,
        level: usize,
        skip_unverified: bool,
        want: &mut [u8],
    ) -> Result<LevelOutcome> {
        let (hash_block, offset) = self.locate(block, level);
        let digest_size = self.device.digest_size();

        // Recovered blocks matched their authenticated digest
        if let Some(recovered) = self.recovered.get(&hash_block) {
            want.copy_from_slice(&recovered[offset..offset + digest_size]);
            return Ok(LevelOutcome::Resolved);
        }

        let cached = self
            .hash_cache
            .read(hash_block)
            .map_err(|source| Error::CacheReadFailure {
                block: hash_block,
                source,
            })?;

        if cached.verified.is_set() {
            want.copy_from_slice(&cached.data[offset..offset + digest_size]);
            return Ok(LevelOutcome::Resolved);
        }

        if skip_unverified {
            return Ok(LevelOutcome::Inconclusive);
        }

        let real = self.device.hasher().digest(&cached.data);
        if real.as_slice() == &*want {
            cached.verified.set();
            trace!(hash_block, level, "Hash block verified");
            want.copy_from_slice(&cached.data[offset..offset + digest_size]);
            return Ok(LevelOutcome::Resolved);
        }

        // A block already being recovered, or already lost, within this
        // request is not decoded again
        let fec = match &self.fec {
            Some(fec) if ctx.begin_metadata(hash_block) => Some(fec),
            Some(_) => {
                trace!(hash_block, depth = ctx.depth(), "Hash block recovery already attempted");
                None
            }
            None => None,
        };

        if let Some(fec) = fec {
            let mut recovered = vec![0u8; self.device.hash_block_size()];
            let decoded = fec.decode_to_buffer(
                self,
                ctx,
                BlockKind::Metadata,
                hash_block,
                want,
                &mut recovered,
            );
            match decoded {
                Ok(()) => {
                    ctx.finish_metadata(hash_block);
                    want.copy_from_slice(&recovered[offset..offset + digest_size]);
                    self.recovered.insert(hash_block, Bytes::from(recovered));
                    return Ok(LevelOutcome::Resolved);
                }
                Err(e) => debug!(hash_block, error = %e, "FEC could not recover hash block"),
            }
        }

        // Lookups made while recovering another block only probe for
        // erasures; the outermost request reports the failure
        if ctx.depth() > 0 {
            return Err(Error::MetadataCorruption { block: hash_block });
        }

        if self.policy.handle(BlockKind::Metadata, hash_block) {
            return Err(Error::MetadataCorruption { block: hash_block });
        }

        want.copy_from_slice(&cached.data[offset..offset + digest_size]);
        Ok(LevelOutcome::Resolved)
    }

    /// Expected digest of data block `block`.
    pub fn verify_for_block(&self, ctx: &mut RecoveryContext, block: u64) -> Result<BlockDigest> {
        let mut digest = vec![0u8; self.device.digest_size()];
        let is_zero = self.verify_for_block_into(ctx, block, &mut digest)?;
        Ok(BlockDigest { digest, is_zero })
    }

    /// Write the expected digest of `block` into `want`. Returns true when
    /// it is the zero-block digest.
    pub fn verify_for_block_into(
        &self,
        ctx: &mut RecoveryContext,
        block: u64,
        want: &mut [u8],
    ) -> Result<bool> {
        let levels = self.device.levels();

        let fast = levels > 0
            && self.verify_level(ctx, block, 0, true, want)? == LevelOutcome::Resolved;

        if !fast {
            want.copy_from_slice(self.device.root_digest());
            for level in (0..levels).rev() {
                self.verify_level(ctx, block, level, false, want)?;
            }
        }

        Ok(self
            .device
            .zero_digest()
            .is_some_and(|zero| zero == &*want))
    }
}
