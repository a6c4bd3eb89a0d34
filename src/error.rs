//! Error types for the verity engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while opening or reading a verity device
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Request Rejection (synchronous, before any I/O is scheduled)
    // =========================================================================
    /// Request start or length is not a multiple of the data block size
    #[error("Unaligned I/O: sector {sector}, {sectors} sectors")]
    MisalignedRequest { sector: u64, sectors: u64 },

    /// Request extends past the last data block
    #[error("I/O out of range: ends at block {end_block}, device has {data_blocks} blocks")]
    OutOfRangeRequest { end_block: u64, data_blocks: u64 },

    /// Verity devices are read-only
    #[error("Write attempted on read-only verity device")]
    WriteAttempted,

    // =========================================================================
    // Corruption
    // =========================================================================
    /// A hash tree block failed verification and could not be recovered
    #[error("Metadata block {block} is corrupted")]
    MetadataCorruption { block: u64 },

    /// A data block failed verification and could not be recovered
    #[error("Data block {block} is corrupted")]
    DataCorruption { block: u64 },

    /// Forward error correction could not reconstruct a block
    #[error("FEC decode failed for block {block}: {reason}")]
    DecodeFailure { block: u64, reason: String },

    // =========================================================================
    // Device I/O
    // =========================================================================
    /// A block read through the cache failed on the underlying device
    #[error("Read of block {block} failed: {source}")]
    CacheReadFailure {
        block: u64,
        #[source]
        source: std::io::Error,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Configuration
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A device parameter is out of range or inconsistent
    #[error("Invalid {parameter}: {reason}")]
    InvalidParameter { parameter: String, reason: String },

    /// Hash algorithm is not supported
    #[error("Unsupported hash algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for an [`Error::InvalidParameter`].
    pub fn invalid(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidParameter {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if the error reports corrupted or unrecoverable content
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::MetadataCorruption { .. }
                | Error::DataCorruption { .. }
                | Error::DecodeFailure { .. }
        )
    }

    /// Returns true if the request was rejected before any I/O was issued
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::MisalignedRequest { .. }
                | Error::OutOfRangeRequest { .. }
                | Error::WriteAttempted
        )
    }

    /// Maps the error to the errno a block layer would surface.
    ///
    /// Everything that happens on the read path is `EIO`; only bad
    /// parameters map to `EINVAL`.
    pub fn errno(&self) -> i32 {
        const EIO: i32 = 5;
        const EINVAL: i32 = 22;

        match self {
            Error::Config(_)
            | Error::InvalidParameter { .. }
            | Error::UnsupportedAlgorithm(_)
            | Error::ConfigParse(_) => EINVAL,
            _ => EIO,
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::ConfigParse(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::ConfigParse(e.to_string())
    }
}
