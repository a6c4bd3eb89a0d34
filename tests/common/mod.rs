//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use blockverity::adapters::{InMemoryNotifier, MemoryDevice, RecordingRestart};
use blockverity::builder::{format_image, FormatOptions, FormattedImage};
use blockverity::cache::BufferedCacheConfig;
use blockverity::config::VerityConfig;
use blockverity::domain::BlockDevice;
use blockverity::pipeline::{TargetDevices, TargetOptions, VerityTarget};

pub const BLOCK: usize = 4096;

/// A formatted image served from memory devices.
pub struct Harness {
    pub target: VerityTarget,
    pub payload: Vec<u8>,
    pub image: FormattedImage,
    pub data: Arc<MemoryDevice>,
    pub hash: Arc<MemoryDevice>,
    pub fec: Option<Arc<MemoryDevice>>,
    pub notifier: Arc<InMemoryNotifier>,
    pub restart: Arc<RecordingRestart>,
    /// Byte offset of data block 0 on the data device
    pub data_offset: u64,
}

impl Harness {
    /// Flip bits of byte `byte` of data block `block` on the device.
    pub fn corrupt_data(&self, block: u64, byte: u64) {
        self.data
            .corrupt(self.data_offset + block * BLOCK as u64 + byte, 0x5A);
    }

    /// Overwrite data block `block` with `fill`.
    pub fn overwrite_data(&self, block: u64, fill: u8) {
        self.data
            .write_at(self.data_offset + block * BLOCK as u64, &[fill; BLOCK]);
    }

    pub fn expected(&self, block: u64, count: u64) -> &[u8] {
        let start = block as usize * BLOCK;
        &self.payload[start..start + count as usize * BLOCK]
    }
}

/// `blocks` blocks of distinct, non-zero content.
pub fn payload(blocks: usize) -> Vec<u8> {
    (0..blocks * BLOCK)
        .map(|i| (((i % 251) as u8) ^ ((i / BLOCK) as u8).wrapping_mul(37)) | 1)
        .collect()
}

pub fn format_options(fec_roots: Option<u8>) -> FormatOptions {
    FormatOptions {
        salt: vec![0u8; 16],
        fec_roots,
        ..FormatOptions::default()
    }
}

/// Format `payload` and open a target over memory devices. `tweak` adjusts
/// the configuration before the target is opened; a non-zero `data_start`
/// prefixes the data device with that many filler sectors.
pub fn harness<F>(payload: Vec<u8>, options: FormatOptions, tweak: F) -> Harness
where
    F: FnOnce(&mut VerityConfig),
{
    harness_with_cache(payload, options, BufferedCacheConfig::default(), tweak)
}

/// Same as [`harness`], with `cache` applied to every device cache.
pub fn harness_with_cache<F>(
    payload: Vec<u8>,
    options: FormatOptions,
    cache: BufferedCacheConfig,
    tweak: F,
) -> Harness
where
    F: FnOnce(&mut VerityConfig),
{
    let image = format_image(&payload, &options).unwrap();
    let mut config = image.full_config("data", "hash", "fec");
    tweak(&mut config);

    let data_offset = config.data_start * 512;
    let mut data_image = vec![0xEEu8; data_offset as usize];
    data_image.extend_from_slice(&payload);

    let data = Arc::new(MemoryDevice::new(data_image));
    let hash = Arc::new(MemoryDevice::new(image.hash_image.clone()));
    let fec = image
        .fec_image
        .clone()
        .map(|parity| Arc::new(MemoryDevice::new(parity)));

    let notifier = Arc::new(InMemoryNotifier::new());
    let restart = Arc::new(RecordingRestart::new());

    let devices = TargetDevices {
        data: data.clone() as Arc<dyn BlockDevice>,
        hash: hash.clone() as Arc<dyn BlockDevice>,
        fec: fec.clone().map(|f| f as Arc<dyn BlockDevice>),
    };
    let options = TargetOptions {
        notifier: notifier.clone(),
        restart: restart.clone(),
        cache,
    };
    let target = VerityTarget::with_devices(&config, devices, options).unwrap();

    Harness {
        target,
        payload,
        image,
        data,
        hash,
        fec,
        notifier,
        restart,
        data_offset,
    }
}
