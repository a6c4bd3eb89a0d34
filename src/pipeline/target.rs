//! Verity Target
//!
//! Accepts block read requests, reads the data device and verifies every
//! block against the hash tree before completing the request.
//!
//! # Request Flow
//!
//! ```text
//! map(request)
//!   │ reject: unaligned │ out of range │ write
//!   ▼
//! prefetch hash blocks ──► VerifyQueue (async, best effort)
//!   │
//!   ▼
//! VerifyQueue job:
//!   read data device ─► for each block:
//!                          expected digest (tree walk)
//!                          zero block?  → zero-fill
//!                          hash payload → match? next
//!                          FEC recovery → ok? next
//!                          error policy → fail or continue
//! ```

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, instrument};

use crate::adapters::{AbortRestart, FileDevice, LoggingNotifier};
use crate::cache::{BufferedCache, BufferedCacheConfig, CacheStats};
use crate::config::VerityConfig;
use crate::device::{VerityDevice, SECTOR_SHIFT};
use crate::domain::{BlockCache, BlockDevice, BlockKind, CorruptionNotifier, RestartHandler};
use crate::error::{Error, Result};
use crate::fec::{FecCaches, FecDecoder};
use crate::metrics::VerityMetrics;
use crate::policy::{ErrorPolicy, VerityMode};
use crate::verifier::HashTreeVerifier;

use super::io::{BlockRequest, Direction, IoBuffer, IoState, IoVerificationContext, SECTOR_SIZE};
use super::workqueue::VerifyQueue;

// =============================================================================
// Construction
// =============================================================================

/// Underlying devices of a target
#[derive(Debug, Clone)]
pub struct TargetDevices {
    pub data: Arc<dyn BlockDevice>,
    pub hash: Arc<dyn BlockDevice>,
    pub fec: Option<Arc<dyn BlockDevice>>,
}

impl TargetDevices {
    /// Open the files named by `config` read-only.
    pub fn open(config: &VerityConfig) -> Result<Self> {
        let data: Arc<dyn BlockDevice> = Arc::new(FileDevice::open(&config.data_device)?);

        let hash: Arc<dyn BlockDevice> = if config.hash_device == config.data_device {
            data.clone()
        } else {
            Arc::new(FileDevice::open(&config.hash_device)?)
        };

        let fec = match &config.fec {
            Some(fec) if fec.device == config.hash_device => Some(hash.clone()),
            Some(fec) if fec.device == config.data_device => Some(data.clone()),
            Some(fec) => Some(Arc::new(FileDevice::open(&fec.device)?) as Arc<dyn BlockDevice>),
            None => None,
        };

        Ok(Self { data, hash, fec })
    }
}

/// Pluggable behaviour of a target
#[derive(Clone)]
pub struct TargetOptions {
    pub notifier: Arc<dyn CorruptionNotifier>,
    pub restart: Arc<dyn RestartHandler>,
    pub cache: BufferedCacheConfig,
}

impl Default for TargetOptions {
    fn default() -> Self {
        Self {
            notifier: Arc::new(LoggingNotifier::new()),
            restart: Arc::new(AbortRestart),
            cache: BufferedCacheConfig::default(),
        }
    }
}

impl std::fmt::Debug for TargetOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetOptions")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

/// Snapshot of a target's state
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub device: String,
    /// `V` (no failures seen) or `C` (corruption detected)
    pub status: char,
    pub mode: VerityMode,
    pub corrupted_errs: u32,
    pub data_blocks: u64,
    pub levels: usize,
    pub fec: bool,
    pub hash_cache: CacheStats,
    pub table: String,
}

// =============================================================================
// Target
// =============================================================================

/// A read-only, verifying view of a data device
#[derive(Debug)]
pub struct VerityTarget {
    device: Arc<VerityDevice>,
    data_dev: Arc<dyn BlockDevice>,
    hash_cache: Arc<BufferedCache>,
    verifier: Arc<HashTreeVerifier>,
    metrics: Arc<VerityMetrics>,
    queue: Arc<VerifyQueue>,
}

impl VerityTarget {
    /// Open the devices named by `config`.
    pub fn open(config: &VerityConfig, options: TargetOptions) -> Result<Self> {
        let devices = TargetDevices::open(config)?;
        Self::with_devices(config, devices, options)
    }

    /// Build a target over already opened devices.
    pub fn with_devices(
        config: &VerityConfig,
        devices: TargetDevices,
        options: TargetOptions,
    ) -> Result<Self> {
        let device = VerityDevice::shared(config)?;
        let block_size = device.data_block_size();
        let hash_block_size = device.hash_block_size();

        let data_needed = device
            .data_blocks()
            .checked_mul(block_size as u64)
            .and_then(|n| n.checked_add(device.data_start() << SECTOR_SHIFT))
            .ok_or_else(|| Error::invalid("data blocks", "device size overflow"))?;
        if devices.data.size_bytes() < data_needed {
            return Err(Error::invalid(
                "data device",
                format!(
                    "{} bytes is smaller than {} required",
                    devices.data.size_bytes(),
                    data_needed
                ),
            ));
        }

        let hash_dev_blocks = devices.hash.size_blocks(hash_block_size);
        if hash_dev_blocks < device.hash_blocks() {
            return Err(Error::invalid(
                "hash device",
                format!(
                    "{} blocks is smaller than {} required",
                    hash_dev_blocks,
                    device.hash_blocks()
                ),
            ));
        }

        let metrics = Arc::new(VerityMetrics::new(device.name())?);
        let policy = Arc::new(ErrorPolicy::new(
            device.name(),
            device.mode(),
            options.notifier,
            options.restart,
            metrics.clone(),
        ));
        let hash_cache = Arc::new(BufferedCache::new(
            devices.hash.clone(),
            hash_block_size,
            options.cache,
        ));

        let mut verifier =
            HashTreeVerifier::new(device.clone(), hash_cache.clone(), policy, metrics.clone());

        if let Some(params) = device.fec() {
            let fec_dev = devices
                .fec
                .clone()
                .ok_or_else(|| Error::Config("FEC configured without a FEC device".into()))?;

            if hash_dev_blocks < device.hash_start() + params.hash_blocks {
                return Err(Error::invalid("fec_blocks", "hash device too small for FEC"));
            }
            let parity_needed = params.start + params.parity_blocks();
            if fec_dev.size_blocks(block_size) < parity_needed {
                return Err(Error::invalid(
                    "fec_start",
                    format!("FEC device needs {} blocks", parity_needed),
                ));
            }

            let caches = FecCaches {
                data: Arc::new(BufferedCache::with_offset(
                    devices.data.clone(),
                    block_size,
                    device.data_start() << SECTOR_SHIFT,
                    options.cache,
                )),
                hash: hash_cache.clone(),
                parity: Arc::new(BufferedCache::new(fec_dev, block_size, options.cache)),
            };
            verifier = verifier.with_fec(FecDecoder::new(device.clone(), caches, metrics.clone())?);
        }

        info!(
            device = %device.name(),
            data_blocks = device.data_blocks(),
            levels = device.levels(),
            algorithm = %device.hasher().algorithm().name(),
            mode = %device.mode(),
            fec = device.fec().is_some(),
            "Verity target ready"
        );

        Ok(Self {
            queue: Arc::new(VerifyQueue::new(device.name())),
            device,
            data_dev: devices.data,
            hash_cache,
            verifier: Arc::new(verifier),
            metrics,
        })
    }

    pub fn device(&self) -> &Arc<VerityDevice> {
        &self.device
    }

    pub fn verifier(&self) -> &Arc<HashTreeVerifier> {
        &self.verifier
    }

    pub fn metrics(&self) -> &Arc<VerityMetrics> {
        &self.metrics
    }

    pub fn hash_cache_stats(&self) -> CacheStats {
        self.hash_cache.stats()
    }

    /// Drop all cached hash blocks, their verified bits and any hash blocks
    /// rebuilt by FEC.
    pub fn evict_hash_cache(&self) {
        self.hash_cache.evict_all();
        self.verifier.forget_recovered();
    }

    /// `V` until a block fails verification, `C` afterwards.
    pub fn status(&self) -> char {
        self.verifier.policy().status_char()
    }

    /// Table line describing this target.
    pub fn table_line(&self) -> String {
        self.device.config().to_table_line()
    }

    pub fn status_report(&self) -> StatusReport {
        let policy = self.verifier.policy();
        StatusReport {
            device: self.device.name().to_string(),
            status: policy.status_char(),
            mode: policy.mode(),
            corrupted_errs: policy.corrupted_errs(),
            data_blocks: self.device.data_blocks(),
            levels: self.device.levels(),
            fec: self.device.fec().is_some(),
            hash_cache: self.hash_cache.stats(),
            table: self.table_line(),
        }
    }

    // =========================================================================
    // Request Path
    // =========================================================================

    /// Serve a block request, returning the verified payload.
    #[instrument(skip(self, request), fields(device = %self.device.name(), sector = request.sector))]
    pub async fn map(&self, request: BlockRequest) -> Result<IoBuffer> {
        let io = match self.accept(&request) {
            Ok(io) => io,
            Err(e) => {
                self.metrics.record_request("rejected");
                return Err(e);
            }
        };

        self.metrics.request_started();
        let result = self.process(request.sector, request.buffer, io).await;
        self.metrics.request_finished();

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) if e.is_corruption() => "corrupt",
            Err(_) => "error",
        };
        self.metrics.record_request(outcome);
        result
    }

    /// Read and verify `count` blocks starting at data block `block`.
    pub async fn read_blocks(&self, block: u64, count: u64) -> Result<Vec<u8>> {
        let shift = self.device.data_block_bits() - SECTOR_SHIFT;
        let len = usize::try_from(count)
            .ok()
            .and_then(|c| c.checked_mul(self.device.data_block_size()))
            .ok_or_else(|| Error::invalid("count", count.to_string()))?;
        let sector = block
            .checked_shl(shift)
            .ok_or_else(|| Error::invalid("block", block.to_string()))?;

        let buffer = self
            .map(BlockRequest::read(sector, IoBuffer::contiguous(len)))
            .await?;
        Ok(buffer.to_vec())
    }

    /// Refuse new requests and wait for queued verification to finish.
    pub async fn shutdown(&self) {
        self.queue.drain().await;
        info!(device = %self.device.name(), "Verity target stopped");
    }

    fn accept(&self, request: &BlockRequest) -> Result<IoVerificationContext> {
        let shift = self.device.data_block_bits() - SECTOR_SHIFT;
        let mask = (1u64 << shift) - 1;
        let sectors = request.sectors();

        if (request.sector | sectors) & mask != 0 || request.buffer.len() % SECTOR_SIZE != 0 {
            error!(sector = request.sector, sectors, "unaligned io");
            return Err(Error::MisalignedRequest {
                sector: request.sector,
                sectors,
            });
        }

        let end_block = request.sector.saturating_add(sectors) >> shift;
        if end_block > self.device.data_blocks() {
            error!(end_block, "io out of range");
            return Err(Error::OutOfRangeRequest {
                end_block,
                data_blocks: self.device.data_blocks(),
            });
        }

        if request.direction == Direction::Write {
            return Err(Error::WriteAttempted);
        }

        Ok(IoVerificationContext::new(
            request.sector >> shift,
            sectors >> shift,
            self.device.digest_size(),
        ))
    }

    async fn process(
        &self,
        sector: u64,
        mut buffer: IoBuffer,
        mut io: IoVerificationContext,
    ) -> Result<IoBuffer> {
        self.submit_prefetch(io.block, io.n_blocks);

        let verifier = self.verifier.clone();
        let data_dev = self.data_dev.clone();
        let offset = self.device.map_sector(sector) << SECTOR_SHIFT;

        let job = self.queue.spawn(move || {
            io.set_state(IoState::Reading);
            if let Err(source) = buffer.read_from(&*data_dev, offset) {
                io.set_state(IoState::Failed);
                return Err(Error::CacheReadFailure {
                    block: io.block,
                    source,
                });
            }

            io.set_state(IoState::Verifying);
            let result = verify_io(&verifier, &mut io, &mut buffer);
            io.set_state(if result.is_ok() {
                IoState::Complete
            } else {
                IoState::Failed
            });
            result.map(|()| buffer)
        })?;

        job.await
            .map_err(|e| Error::Internal(format!("verification task failed: {}", e)))?
    }

    /// Queue reads of the hash blocks the request will need.
    fn submit_prefetch(&self, block: u64, n_blocks: u64) {
        if n_blocks == 0 {
            return;
        }
        let device = self.device.clone();
        let cache = self.hash_cache.clone();
        if let Err(e) = self
            .queue
            .spawn(move || prefetch_hash_blocks(&device, &*cache, block, n_blocks))
        {
            debug!(error = %e, "Prefetch not queued");
        }
    }
}

/// Read levels `L-2 ..= 0` of the tree for `block .. block + n_blocks`.
/// The root level is read by the walk itself.
fn prefetch_hash_blocks(device: &VerityDevice, cache: &dyn BlockCache, block: u64, n_blocks: u64) {
    let levels = device.levels();
    if levels < 2 {
        return;
    }

    for level in (0..levels - 1).rev() {
        let (mut start, _) = device.hash_block_at_level(block, level);
        let (mut end, _) = device.hash_block_at_level(block + n_blocks - 1, level);

        if level == 0 {
            let mut cluster = (device.prefetch_cluster() >> device.data_block_bits()) as u64;
            if cluster > 0 {
                if !cluster.is_power_of_two() {
                    cluster = 1 << (u64::BITS - 1 - cluster.leading_zeros());
                }
                start &= !(cluster - 1);
                end |= cluster - 1;
                end = end.min(device.hash_blocks().saturating_sub(1));
            }
        }

        cache.prefetch(start, end.saturating_sub(start) + 1);
    }
}

/// Verify every block of a request whose payload has been read.
fn verify_io(
    verifier: &HashTreeVerifier,
    io: &mut IoVerificationContext,
    buffer: &mut IoBuffer,
) -> Result<()> {
    let device = verifier.device();
    let metrics = verifier.metrics();
    let block_size = device.data_block_size();

    for b in 0..io.n_blocks {
        let block = io.block + b;

        let is_zero = verifier.verify_for_block_into(&mut io.recovery, block, &mut io.want_digest)?;
        if is_zero {
            buffer.for_each_chunk(&mut io.cursor, block_size, |chunk| {
                chunk.fill(0);
                Ok(())
            })?;
            metrics.record_zero_block();
            continue;
        }

        let start = io.cursor;
        let mut state = device.hasher().init();
        buffer.for_each_chunk(&mut io.cursor, block_size, |chunk| {
            state.update(chunk);
            Ok(())
        })?;
        state.finalize_into(&mut io.real_digest);

        if io.real_digest == io.want_digest {
            metrics.record_verified();
            continue;
        }

        if let Some(fec) = verifier.fec() {
            let mut cursor = start;
            match fec.decode_to_io(
                verifier,
                &mut io.recovery,
                block,
                &io.want_digest,
                buffer,
                &mut cursor,
            ) {
                Ok(()) => continue,
                Err(e) => debug!(block, error = %e, "FEC could not recover data block"),
            }
        }

        if verifier.policy().handle(BlockKind::Data, block) {
            return Err(Error::DataCorruption { block });
        }
    }

    Ok(())
}
