//! FEC Decoder
//!
//! Reconstructs a single block from its interleaved round.
//!
//! # Recovery
//!
//! ```text
//! 1. read every block of the round into scratch (deinterleaved)
//! 2. RS-decode each of the block_size codewords, keep the target symbol
//! 3. accept only if the rebuilt block hashes to the expected digest
//! 4. otherwise retry once, marking data blocks with bad digests as erasures
//! ```
//!
//! Finding erasures verifies other data blocks, which may itself need FEC;
//! [`RecoveryContext`] bounds that nesting at [`MAX_RECURSION`].

use std::sync::Arc;

use bytes::Bytes;
use tracing::{error, trace, warn};

use super::codec::{RsCodec, GF_ORDER};
use super::{region_source, FecScratch, RecoveryContext, RegionBlock, MAX_RECURSION};
use crate::device::{FecParams, VerityDevice};
use crate::domain::{BlockCache, BlockKind};
use crate::error::{Error, Result};
use crate::metrics::VerityMetrics;
use crate::pipeline::io::{BufferCursor, IoBuffer};
use crate::verifier::HashTreeVerifier;

/// Caches the decoder reads through
#[derive(Debug, Clone)]
pub struct FecCaches {
    /// Data device, block 0 at the start of the data area
    pub data: Arc<dyn BlockCache>,
    pub hash: Arc<dyn BlockCache>,
    /// FEC device, read in data-block-size units
    pub parity: Arc<dyn BlockCache>,
}

/// Recovers corrupted data and hash blocks
#[derive(Debug)]
pub struct FecDecoder {
    device: Arc<VerityDevice>,
    params: FecParams,
    codec: RsCodec,
    caches: FecCaches,
    metrics: Arc<VerityMetrics>,
}

impl FecDecoder {
    pub fn new(
        device: Arc<VerityDevice>,
        caches: FecCaches,
        metrics: Arc<VerityMetrics>,
    ) -> Result<Self> {
        let params = *device
            .fec()
            .ok_or_else(|| Error::Config("device has no FEC parameters".into()))?;
        let codec = RsCodec::new(params.roots as usize)
            .map_err(|e| Error::invalid("fec_roots", e.to_string()))?;

        Ok(Self {
            device,
            params,
            codec,
            caches,
            metrics,
        })
    }

    pub fn params(&self) -> &FecParams {
        &self.params
    }

    /// Recover `block` into `dest`, which must be one block long.
    pub fn decode_to_buffer(
        &self,
        verifier: &HashTreeVerifier,
        ctx: &mut RecoveryContext,
        kind: BlockKind,
        block: u64,
        want: &[u8],
        dest: &mut [u8],
    ) -> Result<()> {
        let scratch = self.recover(verifier, ctx, kind, block, want)?;
        let block_size = self.device.data_block_size();
        dest.copy_from_slice(&scratch.buf[..block_size]);
        ctx.release_scratch(scratch);
        Ok(())
    }

    /// Recover data block `block` into `buffer`, starting at `cursor`.
    pub fn decode_to_io(
        &self,
        verifier: &HashTreeVerifier,
        ctx: &mut RecoveryContext,
        block: u64,
        want: &[u8],
        buffer: &mut IoBuffer,
        cursor: &mut BufferCursor,
    ) -> Result<()> {
        let scratch = self.recover(verifier, ctx, BlockKind::Data, block, want)?;
        let block_size = self.device.data_block_size();
        let result = buffer.write_at_cursor(cursor, &scratch.buf[..block_size]);
        ctx.release_scratch(scratch);
        result
    }

    /// Index of `block` in the covered region.
    fn region_block(&self, kind: BlockKind, block: u64) -> Result<u64> {
        let data_blocks = self.device.data_blocks();
        let region_block = match kind {
            BlockKind::Data => Some(block),
            BlockKind::Metadata => block
                .checked_sub(self.device.hash_start())
                .map(|offset| data_blocks + offset),
        };

        match region_block {
            Some(b) if b < self.params.blocks && (kind == BlockKind::Metadata || b < data_blocks) => {
                Ok(b)
            }
            _ => Err(Error::DecodeFailure {
                block,
                reason: "block not covered by FEC".into(),
            }),
        }
    }

    fn recover(
        &self,
        verifier: &HashTreeVerifier,
        ctx: &mut RecoveryContext,
        kind: BlockKind,
        block: u64,
        want: &[u8],
    ) -> Result<FecScratch> {
        let region_block = self.region_block(kind, block)?;

        if !ctx.enter() {
            return Err(Error::DecodeFailure {
                block,
                reason: format!("recursion depth exceeds {}", MAX_RECURSION),
            });
        }
        let result = self.recover_region_block(verifier, ctx, kind, block, region_block, want);
        ctx.leave();

        match &result {
            Ok(_) => self.metrics.record_fec_corrected(kind),
            Err(_) => self.metrics.record_fec_failure(),
        }
        result
    }

    fn recover_region_block(
        &self,
        verifier: &HashTreeVerifier,
        ctx: &mut RecoveryContext,
        kind: BlockKind,
        block: u64,
        region_block: u64,
        want: &[u8],
    ) -> Result<FecScratch> {
        let block_size = self.device.data_block_size();
        let round = region_block % self.params.rounds;
        let target = (region_block / self.params.rounds) as usize;

        let mut reason = String::new();
        for use_erasures in [false, true] {
            let mut scratch = self.read_round(verifier, ctx, round, use_erasures)?;

            match self.decode_round(&mut scratch, block, round, target) {
                Ok(corrected) => {
                    let digest = self.device.hasher().digest(&scratch.buf[..block_size]);
                    if digest == want {
                        if corrected > 0 {
                            warn!(
                                device = %self.device.name(),
                                kind = %kind,
                                block,
                                corrected,
                                erasures = scratch.erasures.len(),
                                "FEC corrected {} errors",
                                corrected
                            );
                        }
                        return Ok(scratch);
                    }
                    reason = "recovered block does not match digest".into();
                }
                Err(e) => reason = e.to_string(),
            }

            trace!(block, use_erasures, %reason, "FEC attempt failed");
            ctx.release_scratch(scratch);
        }

        error!(
            device = %self.device.name(),
            kind = %kind,
            block,
            %reason,
            "FEC failed to correct block"
        );
        Err(Error::DecodeFailure { block, reason })
    }

    /// Read and deinterleave the `rsn` blocks of `round`.
    fn read_round(
        &self,
        verifier: &HashTreeVerifier,
        ctx: &mut RecoveryContext,
        round: u64,
        use_erasures: bool,
    ) -> Result<FecScratch> {
        let block_size = self.device.data_block_size();
        let rsn = self.params.rsn as usize;
        let roots = self.params.roots as usize;
        let mut scratch = ctx.take_scratch(rsn * block_size);
        let mut want = vec![0u8; self.device.digest_size()];

        for i in 0..rsn {
            let region_block = round + i as u64 * self.params.rounds;
            let source = region_source(
                region_block,
                self.device.data_blocks(),
                self.device.hash_start(),
                self.params.hash_blocks,
            );

            let (cache, device_block) = match source {
                RegionBlock::Padding => continue,
                RegionBlock::Data(b) => (&self.caches.data, b),
                RegionBlock::Hash(b) => (&self.caches.hash, b),
            };

            // Hash blocks already rebuilt by FEC stand in for their on-disk copy
            let recovered = match source {
                RegionBlock::Hash(b) => verifier.recovered_block(b),
                _ => None,
            };
            let read = match recovered {
                Some(data) => Ok(data),
                None => cache.read(device_block).map(|cached| cached.data),
            };

            let data: Bytes = match read {
                Ok(data) => data,
                Err(e) => {
                    warn!(block = device_block, error = %e, "FEC read failed, treating as erasure");
                    if use_erasures && scratch.erasures.len() < roots {
                        scratch.erasures.push(i);
                    }
                    continue;
                }
            };

            // Without erasures a digest is only needed to spot zero blocks
            let needs_digest = use_erasures || self.device.zero_digest().is_some();
            if let (RegionBlock::Data(b), true) = (source, needs_digest) {
                match verifier.verify_for_block_into(ctx, b, &mut want) {
                    // Zero blocks contribute zeros no matter what is on disk
                    Ok(true) => continue,
                    Ok(false) => {
                        if use_erasures
                            && scratch.erasures.len() < roots
                            && self.device.hasher().digest(&data) != want
                        {
                            scratch.erasures.push(i);
                        }
                    }
                    Err(e) => trace!(block = b, error = %e, "No digest for erasure check"),
                }
            }

            for (j, &byte) in data.iter().enumerate() {
                scratch.buf[j * rsn + i] = byte;
            }
        }

        Ok(scratch)
    }

    /// Decode every codeword of `round`, compacting the target block into
    /// the front of the scratch buffer. Returns the number of corrected
    /// symbols.
    fn decode_round(
        &self,
        scratch: &mut FecScratch,
        block: u64,
        round: u64,
        target: usize,
    ) -> Result<usize> {
        let block_size = self.device.data_block_size();
        let rsn = self.params.rsn as usize;
        let roots = self.params.roots as usize;

        let mut parity = ParityReader::new(&*self.caches.parity, self.params.start, block_size);
        let mut codeword = [0u8; GF_ORDER];
        let mut corrected = 0;

        for j in 0..block_size {
            codeword[..rsn].copy_from_slice(&scratch.buf[j * rsn..(j + 1) * rsn]);

            let index = round * block_size as u64 + j as u64;
            parity.read(index * roots as u64, &mut codeword[rsn..])?;

            corrected += self
                .codec
                .decode(&mut codeword, &scratch.erasures)
                .map_err(|e| Error::DecodeFailure {
                    block,
                    reason: e.to_string(),
                })?;

            // Byte j belongs to codeword j / rsn, which has been consumed
            scratch.buf[j] = codeword[target];
        }

        Ok(corrected)
    }
}

/// Sequential reader over the parity area. Parity runs may straddle block
/// boundaries.
struct ParityReader<'a> {
    cache: &'a dyn BlockCache,
    start: u64,
    block_size: usize,
    current: Option<(u64, Bytes)>,
}

impl<'a> ParityReader<'a> {
    fn new(cache: &'a dyn BlockCache, start: u64, block_size: usize) -> Self {
        Self {
            cache,
            start,
            block_size,
            current: None,
        }
    }

    fn block(&mut self, index: u64) -> Result<Bytes> {
        if let Some((cached, data)) = &self.current {
            if *cached == index {
                return Ok(data.clone());
            }
        }

        let device_block = self.start + index;
        let data = self
            .cache
            .read(device_block)
            .map_err(|source| Error::CacheReadFailure {
                block: device_block,
                source,
            })?
            .data;
        self.current = Some((index, data.clone()));
        Ok(data)
    }

    fn read(&mut self, offset: u64, out: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < out.len() {
            let position = offset + done as u64;
            let index = position / self.block_size as u64;
            let within = (position % self.block_size as u64) as usize;

            let data = self.block(index)?;
            let n = (out.len() - done).min(self.block_size - within);
            out[done..done + n].copy_from_slice(&data[within..within + n]);
            done += n;
        }
        Ok(())
    }
}
