//! Image Builder
//!
//! Formats a data image: builds the hash tree bottom-up, computes the root
//! digest and, optionally, the interleaved FEC parity area.
//!
//! Output layout matches what [`VerityTarget`](crate::pipeline::VerityTarget)
//! reads back:
//!
//! ```text
//! hash image:  | hash_start blocks (zero) | level L-1 | ... | level 0 |
//! fec image:   | round 0 parity | round 1 parity | ... |
//! ```

use tracing::{debug, info, instrument};

use crate::config::{FecConfig, VerityConfig, DEFAULT_PREFETCH_CLUSTER};
use crate::device::{
    block_bits, slot_offset, TreeGeometry, VerityDevice, MAX_DATA_BLOCK_SIZE,
};
use crate::error::{Error, Result};
use crate::fec::FecEncoder;
use crate::hash::{algorithm_by_name, VerityHasher};
use crate::policy::VerityMode;

/// Parameters for [`format_image`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatOptions {
    pub version: u8,
    pub data_block_size: u32,
    pub hash_block_size: u32,
    pub algorithm: String,
    pub salt: Vec<u8>,
    /// Blocks reserved at the front of the hash image
    pub hash_start: u64,
    /// Generate FEC parity with this many roots
    pub fec_roots: Option<u8>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            version: 1,
            data_block_size: 4096,
            hash_block_size: 4096,
            algorithm: "sha256".to_string(),
            salt: Vec::new(),
            hash_start: 0,
            fec_roots: None,
        }
    }
}

/// A formatted image
#[derive(Debug, Clone)]
pub struct FormattedImage {
    pub options: FormatOptions,
    pub data_blocks: u64,
    pub levels: usize,
    pub root_digest: Vec<u8>,
    /// Hash device contents, including the reserved prefix
    pub hash_image: Vec<u8>,
    /// FEC device contents
    pub fec_image: Option<Vec<u8>>,
    /// Blocks covered by FEC
    pub fec_blocks: u64,
}

impl FormattedImage {
    /// Device configuration for this image, without FEC.
    pub fn config(&self, data_device: &str, hash_device: &str) -> VerityConfig {
        let salt = if self.options.salt.is_empty() {
            "-".to_string()
        } else {
            hex::encode(&self.options.salt)
        };

        VerityConfig {
            version: self.options.version,
            data_device: data_device.to_string(),
            hash_device: hash_device.to_string(),
            data_block_size: self.options.data_block_size,
            hash_block_size: self.options.hash_block_size,
            data_blocks: self.data_blocks,
            hash_start: self.options.hash_start,
            algorithm: self.options.algorithm.to_ascii_lowercase(),
            root_digest: hex::encode(&self.root_digest),
            salt,
            mode: VerityMode::default(),
            ignore_zero_blocks: false,
            fec: None,
            data_start: 0,
            prefetch_cluster: DEFAULT_PREFETCH_CLUSTER,
        }
    }

    /// FEC settings for this image with parity stored on `fec_device`.
    pub fn fec_config(&self, fec_device: &str) -> Option<FecConfig> {
        let roots = self.options.fec_roots?;
        self.fec_image.as_ref()?;
        Some(FecConfig {
            device: fec_device.to_string(),
            blocks: self.fec_blocks,
            start: 0,
            roots,
        })
    }

    /// Device configuration including FEC when parity was generated.
    pub fn full_config(&self, data_device: &str, hash_device: &str, fec_device: &str) -> VerityConfig {
        let mut config = self.config(data_device, hash_device);
        config.fec = self.fec_config(fec_device);
        config
    }
}

/// Build the hash tree (and FEC parity) for `data`.
#[instrument(skip(data, options), fields(len = data.len()))]
pub fn format_image(data: &[u8], options: &FormatOptions) -> Result<FormattedImage> {
    if options.version > 1 {
        return Err(Error::invalid("version", options.version.to_string()));
    }
    let data_bits = block_bits(options.data_block_size, MAX_DATA_BLOCK_SIZE, "data block size")?;
    let hash_bits = block_bits(options.hash_block_size, i32::MAX as u32, "hash block size")?;
    let block_size = 1usize << data_bits;
    let hash_block_size = 1usize << hash_bits;

    if data.is_empty() || data.len() % block_size != 0 {
        return Err(Error::invalid(
            "data",
            format!("length {} is not a non-zero multiple of {}", data.len(), block_size),
        ));
    }

    let hasher = VerityHasher::new(
        algorithm_by_name(&options.algorithm)?,
        &options.salt,
        options.version,
    );
    let digest_size = hasher.digest_size();
    let data_blocks = (data.len() / block_size) as u64;

    let geometry = TreeGeometry::new(
        data_blocks,
        options.hash_block_size,
        digest_size,
        options.hash_start,
    )?;
    let per_block = 1usize << geometry.hash_per_block_bits;

    let image_len = usize::try_from(geometry.hash_blocks)
        .ok()
        .and_then(|blocks| blocks.checked_mul(hash_block_size))
        .ok_or_else(|| Error::invalid("hash start", "hash image too large"))?;
    let mut hash_image = vec![0u8; image_len];

    let mut digests: Vec<Vec<u8>> = data.chunks(block_size).map(|b| hasher.digest(b)).collect();

    for level in 0..geometry.levels {
        let start = geometry.level_start[level] as usize;
        let mut parents = Vec::with_capacity(digests.len().div_ceil(per_block));

        for (k, children) in digests.chunks(per_block).enumerate() {
            let offset = (start + k) * hash_block_size;
            let block = &mut hash_image[offset..offset + hash_block_size];
            for (idx, digest) in children.iter().enumerate() {
                let slot = slot_offset(
                    options.version,
                    idx,
                    digest_size,
                    hash_bits,
                    geometry.hash_per_block_bits,
                );
                block[slot..slot + digest_size].copy_from_slice(digest);
            }
            parents.push(hasher.digest(block));
        }

        debug!(level, blocks = parents.len(), "Built hash level");
        digests = parents;
    }

    let root_digest = digests
        .into_iter()
        .next()
        .ok_or_else(|| Error::Internal("empty hash tree".into()))?;

    let fec_blocks = data_blocks + (geometry.hash_blocks - options.hash_start);
    let fec_image = match options.fec_roots {
        Some(roots) => {
            if block_size != hash_block_size {
                return Err(Error::invalid("fec", "block sizes must match to use FEC"));
            }
            let encoder = FecEncoder::new(roots, block_size)?;
            let parity = encoder.encode(fec_blocks, |b| {
                if b < data_blocks {
                    let start = b as usize * block_size;
                    data.get(start..start + block_size)
                } else {
                    let start = (options.hash_start + b - data_blocks) as usize * block_size;
                    hash_image.get(start..start + block_size)
                }
            })?;
            Some(parity)
        }
        None => None,
    };

    let image = FormattedImage {
        options: options.clone(),
        data_blocks,
        levels: geometry.levels,
        root_digest,
        hash_image,
        fec_image,
        fec_blocks,
    };

    // Round-trip the result through the device validation
    VerityDevice::new(&image.full_config("data", "hash", "fec"))?;

    info!(
        data_blocks,
        levels = image.levels,
        root = %hex::encode(&image.root_digest),
        "Formatted image"
    );
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    fn options(block_size: u32) -> FormatOptions {
        FormatOptions {
            data_block_size: block_size,
            hash_block_size: block_size,
            ..FormatOptions::default()
        }
    }

    #[test]
    fn test_single_level_root() {
        let data = vec![0xABu8; 4 * 4096];
        let image = format_image(&data, &options(4096)).unwrap();
        assert_eq!(image.levels, 1);
        assert_eq!(image.hash_image.len(), 4096);

        // Leaf block holds the four block digests then zeros
        let leaf = Sha256::digest(&data[..4096]);
        assert_eq!(&image.hash_image[..32], leaf.as_slice());
        assert_eq!(&image.hash_image[96..128], leaf.as_slice());
        assert!(image.hash_image[128..].iter().all(|&b| b == 0));

        let root = Sha256::digest(&image.hash_image[..4096]);
        assert_eq!(image.root_digest, root.to_vec());
    }

    #[test]
    fn test_single_block_root_is_block_digest() {
        let data = vec![1u8; 4096];
        let image = format_image(&data, &options(4096)).unwrap();
        assert_eq!(image.levels, 0);
        assert!(image.hash_image.is_empty());
        assert_eq!(image.root_digest, Sha256::digest(&data).to_vec());
    }

    #[test]
    fn test_hash_start_reserved() {
        let data = vec![2u8; 40 * 512];
        let mut opts = options(512);
        opts.hash_start = 2;
        let image = format_image(&data, &opts).unwrap();
        // Two reserved blocks, one root block, three leaves
        assert_eq!(image.hash_image.len(), 6 * 512);
        assert!(image.hash_image[..1024].iter().all(|&b| b == 0));
        assert_eq!(image.config("d", "h").hash_start, 2);
    }

    #[test]
    fn test_config_from_image() {
        let mut opts = options(4096);
        opts.salt = vec![0u8; 16];
        opts.fec_roots = Some(2);
        let image = format_image(&vec![3u8; 16 * 4096], &opts).unwrap();

        let config = image.full_config("data.img", "hash.img", "fec.img");
        assert_eq!(config.data_blocks, 16);
        assert_eq!(config.salt, "00".repeat(16));
        let fec = config.fec.unwrap();
        assert_eq!(fec.blocks, 17);
        assert_eq!(fec.roots, 2);
        assert_eq!(image.fec_image.as_ref().unwrap().len(), 2 * 4096);
    }

    #[test]
    fn test_version_0_packs_digests() {
        let mut opts = options(512);
        opts.version = 0;
        opts.algorithm = "sha224".into();
        let image = format_image(&vec![5u8; 4 * 512], &opts).unwrap();

        let hasher = VerityHasher::new(algorithm_by_name("sha224").unwrap(), &[], 0);
        let leaf = hasher.digest(&[5u8; 512]);
        assert_eq!(&image.hash_image[28..56], leaf.as_slice());
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(format_image(&[], &options(4096)).is_err());
        assert!(format_image(&[0u8; 1000], &options(512)).is_err());
        assert!(format_image(&[0u8; 4096], &options(1000)).is_err());

        let mut opts = options(4096);
        opts.algorithm = "md5".into();
        assert!(format_image(&[0u8; 4096], &opts).is_err());
    }
}
