//! Verity Device Configuration
//!
//! A [`VerityConfig`] describes one verity device: where the data and hash
//! trees live, the block geometry, the trusted root digest and the optional
//! features. It can be loaded from YAML/JSON or parsed from a table line of
//! the form:
//!
//! ```text
//! <version> <data dev> <hash dev> <data block size> <hash block size>
//! <data blocks> <hash start block> <algorithm> <root digest> <salt|->
//! [<#opt args> <opt args>...]
//! ```
//!
//! Optional arguments: `ignore_corruption`, `restart_on_corruption`,
//! `ignore_zero_blocks`, `use_fec_from_device <dev>`, `fec_blocks <n>`,
//! `fec_start <n>`, `fec_roots <n>`.

use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::policy::VerityMode;

// =============================================================================
// Constants
// =============================================================================

/// Default prefetch cluster in bytes
pub const DEFAULT_PREFETCH_CLUSTER: u32 = 262_144;

/// Number of positional arguments in a table line
pub const TABLE_POSITIONAL_ARGS: usize = 10;

/// Maximum number of optional feature arguments
pub const MAX_FEATURE_ARGS: usize = 2 + FEC_FEATURE_ARGS;

/// Feature arguments taken by the complete set of FEC options
const FEC_FEATURE_ARGS: usize = 8;

pub const OPT_IGNORE_CORRUPTION: &str = "ignore_corruption";
pub const OPT_RESTART_ON_CORRUPTION: &str = "restart_on_corruption";
pub const OPT_IGNORE_ZERO_BLOCKS: &str = "ignore_zero_blocks";
pub const OPT_FEC_DEVICE: &str = "use_fec_from_device";
pub const OPT_FEC_BLOCKS: &str = "fec_blocks";
pub const OPT_FEC_START: &str = "fec_start";
pub const OPT_FEC_ROOTS: &str = "fec_roots";

fn default_salt() -> String {
    "-".to_string()
}

fn default_prefetch_cluster() -> u32 {
    DEFAULT_PREFETCH_CLUSTER
}

// =============================================================================
// Configuration Types
// =============================================================================

/// Forward error correction settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FecConfig {
    /// Device holding the parity region
    pub device: String,

    /// Number of blocks covered by FEC (data + hash + optional metadata)
    #[serde(default)]
    pub blocks: u64,

    /// First parity block on the FEC device
    #[serde(default)]
    pub start: u64,

    /// Parity bytes per RS(255, N) codeword
    #[serde(default)]
    pub roots: u8,
}

/// Complete description of a verity device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerityConfig {
    /// On-disk format version (0 = salt appended, 1 = salt prepended)
    pub version: u8,

    /// Device or image holding the protected data
    pub data_device: String,

    /// Device or image holding the hash tree
    pub hash_device: String,

    pub data_block_size: u32,

    pub hash_block_size: u32,

    /// Number of data blocks protected by the tree
    pub data_blocks: u64,

    /// Block index on the hash device where the tree starts
    pub hash_start: u64,

    /// Hash algorithm name (e.g. `sha256`)
    pub algorithm: String,

    /// Trusted root digest, hex encoded
    pub root_digest: String,

    /// Salt, hex encoded, or `-` for none
    #[serde(default = "default_salt")]
    pub salt: String,

    /// Behaviour on unrecoverable corruption
    #[serde(default)]
    pub mode: VerityMode,

    /// Return zeros without reading for blocks whose digest is the zero-block digest
    #[serde(default)]
    pub ignore_zero_blocks: bool,

    /// Forward error correction
    #[serde(default)]
    pub fec: Option<FecConfig>,

    /// Offset of the data area on the data device, in 512-byte sectors
    #[serde(default)]
    pub data_start: u64,

    /// Hash prefetch cluster size in bytes (0 disables clustering)
    #[serde(default = "default_prefetch_cluster")]
    pub prefetch_cluster: u32,
}

impl VerityConfig {
    /// Load a configuration file. `.json` files are parsed as JSON, anything
    /// else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;

        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            _ => serde_yaml::from_str(&contents)?,
        };

        Ok(config)
    }

    /// Parse a whitespace separated table line.
    pub fn from_table_line(line: &str) -> Result<Self> {
        let args: Vec<&str> = line.split_whitespace().collect();
        Self::from_table_args(&args)
    }

    /// Parse table arguments.
    pub fn from_table_args(args: &[&str]) -> Result<Self> {
        if args.len() < TABLE_POSITIONAL_ARGS {
            return Err(Error::Config("Not enough arguments".into()));
        }

        let version: u8 = match args[0].parse::<u32>() {
            Ok(v) if v <= 1 => v as u8,
            _ => return Err(Error::invalid("version", args[0])),
        };

        let data_block_size = parse_u32(args[3], "data device block size")?;
        let hash_block_size = parse_u32(args[4], "hash device block size")?;
        let data_blocks = parse_u64(args[5], "data blocks")?;
        let hash_start = parse_u64(args[6], "hash start")?;

        let mut config = VerityConfig {
            version,
            data_device: args[1].to_string(),
            hash_device: args[2].to_string(),
            data_block_size,
            hash_block_size,
            data_blocks,
            hash_start,
            algorithm: args[7].to_string(),
            root_digest: args[8].to_string(),
            salt: args[9].to_string(),
            mode: VerityMode::default(),
            ignore_zero_blocks: false,
            fec: None,
            data_start: 0,
            prefetch_cluster: DEFAULT_PREFETCH_CLUSTER,
        };

        let rest = &args[TABLE_POSITIONAL_ARGS..];
        if !rest.is_empty() {
            config.parse_feature_args(rest)?;
        }

        config.root_digest_bytes()?;
        config.salt_bytes()?;

        Ok(config)
    }

    fn parse_feature_args(&mut self, rest: &[&str]) -> Result<()> {
        let count = match rest[0].parse::<usize>() {
            Ok(n) if n <= MAX_FEATURE_ARGS => n,
            _ => return Err(Error::Config("Invalid number of feature args".into())),
        };

        if rest.len() - 1 < count {
            return Err(Error::Config("Not enough feature arguments".into()));
        }

        let mut fec_device: Option<String> = None;
        let mut fec_blocks = 0u64;
        let mut fec_start = 0u64;
        let mut fec_roots = 0u8;

        let mut iter = rest[1..=count].iter();
        while let Some(opt) = iter.next() {
            let opt = opt.to_ascii_lowercase();
            match opt.as_str() {
                OPT_IGNORE_CORRUPTION => self.mode = VerityMode::LogOnly,
                OPT_RESTART_ON_CORRUPTION => self.mode = VerityMode::Restart,
                OPT_IGNORE_ZERO_BLOCKS => self.ignore_zero_blocks = true,
                OPT_FEC_DEVICE | OPT_FEC_BLOCKS | OPT_FEC_START | OPT_FEC_ROOTS => {
                    let value = iter
                        .next()
                        .ok_or_else(|| Error::Config("Invalid feature arguments".into()))?;
                    match opt.as_str() {
                        OPT_FEC_DEVICE => fec_device = Some(value.to_string()),
                        OPT_FEC_BLOCKS => fec_blocks = parse_u64(value, OPT_FEC_BLOCKS)?,
                        OPT_FEC_START => fec_start = parse_u64(value, OPT_FEC_START)?,
                        _ => {
                            fec_roots = match value.parse::<u8>() {
                                Ok(n) if n > 0 && n < 255 => n,
                                _ => return Err(Error::invalid(OPT_FEC_ROOTS, *value)),
                            }
                        }
                    }
                }
                _ => return Err(Error::Config("Invalid feature arguments".into())),
            }
        }

        // FEC options without a device are accepted and ignored
        self.fec = fec_device.map(|device| FecConfig {
            device,
            blocks: fec_blocks,
            start: fec_start,
            roots: fec_roots,
        });

        Ok(())
    }

    /// Decode the root digest.
    pub fn root_digest_bytes(&self) -> Result<Vec<u8>> {
        hex::decode(&self.root_digest).map_err(|e| Error::invalid("root digest", e.to_string()))
    }

    /// Decode the salt; `-` means no salt.
    pub fn salt_bytes(&self) -> Result<Vec<u8>> {
        if self.salt == "-" || self.salt.is_empty() {
            return Ok(Vec::new());
        }
        hex::decode(&self.salt).map_err(|e| Error::invalid("salt", e.to_string()))
    }

    /// Format the configuration back into a table line.
    pub fn to_table_line(&self) -> String {
        let mut line = format!(
            "{} {} {} {} {} {} {} {} {} {}",
            self.version,
            self.data_device,
            self.hash_device,
            self.data_block_size,
            self.hash_block_size,
            self.data_blocks,
            self.hash_start,
            self.algorithm,
            self.root_digest.to_ascii_lowercase(),
            if self.salt.is_empty() { "-" } else { self.salt.as_str() },
        );

        let mut opts: Vec<String> = Vec::new();
        if let Some(arg) = self.mode.feature_arg() {
            opts.push(arg.into());
        }
        if self.ignore_zero_blocks {
            opts.push(OPT_IGNORE_ZERO_BLOCKS.into());
        }
        if let Some(fec) = &self.fec {
            opts.push(OPT_FEC_DEVICE.into());
            opts.push(fec.device.clone());
            opts.push(OPT_FEC_BLOCKS.into());
            opts.push(fec.blocks.to_string());
            opts.push(OPT_FEC_START.into());
            opts.push(fec.start.to_string());
            opts.push(OPT_FEC_ROOTS.into());
            opts.push(fec.roots.to_string());
        }

        if !opts.is_empty() {
            let _ = write!(line, " {}", opts.len());
            for opt in opts {
                let _ = write!(line, " {}", opt);
            }
        }

        line
    }
}

fn parse_u64(value: &str, what: &str) -> Result<u64> {
    value.parse::<u64>().map_err(|_| Error::invalid(what, value))
}

fn parse_u32(value: &str, what: &str) -> Result<u32> {
    value.parse::<u32>().map_err(|_| Error::invalid(what, value))
}
