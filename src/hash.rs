//! Digest Algorithms and Verity Salting
//!
//! The digest algorithm is resolved once when the device is opened and held
//! as an `Arc<dyn DigestAlgorithm>` for the device's lifetime. The hot path
//! never branches on the algorithm name.
//!
//! # Salting
//!
//! - Version 0 hashes `data || salt` (salt appended on finalize)
//! - Version 1 hashes `salt || data` (salt prepended on init)

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use sha2::digest::DynDigest;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

use crate::error::{Error, Result};

// =============================================================================
// Algorithm Interface
// =============================================================================

/// A hash function usable for verity trees.
pub trait DigestAlgorithm: Send + Sync + fmt::Debug {
    /// Canonical algorithm name as it appears in a table line.
    fn name(&self) -> &'static str;

    /// Digest length in bytes.
    fn digest_size(&self) -> usize;

    /// Start a fresh hashing state.
    fn begin(&self) -> Box<dyn DynDigest>;
}

/// SHA-2 family implementation, one instance per output size.
struct Sha2Family<D> {
    name: &'static str,
    _marker: PhantomData<fn() -> D>,
}

impl<D> Sha2Family<D> {
    const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }
}

impl<D> fmt::Debug for Sha2Family<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sha2Family").field("name", &self.name).finish()
    }
}

impl<D> DigestAlgorithm for Sha2Family<D>
where
    D: Digest + DynDigest + Default + 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn digest_size(&self) -> usize {
        <D as Digest>::output_size()
    }

    fn begin(&self) -> Box<dyn DynDigest> {
        Box::new(D::default())
    }
}

/// Names accepted by [`algorithm_by_name`].
pub const SUPPORTED_ALGORITHMS: &[&str] = &["sha224", "sha256", "sha384", "sha512"];

/// Resolve an algorithm by its table-line name (case-insensitive).
pub fn algorithm_by_name(name: &str) -> Result<Arc<dyn DigestAlgorithm>> {
    let alg: Arc<dyn DigestAlgorithm> = match name.to_ascii_lowercase().as_str() {
        "sha224" => Arc::new(Sha2Family::<Sha224>::new("sha224")),
        "sha256" => Arc::new(Sha2Family::<Sha256>::new("sha256")),
        "sha384" => Arc::new(Sha2Family::<Sha384>::new("sha384")),
        "sha512" => Arc::new(Sha2Family::<Sha512>::new("sha512")),
        _ => return Err(Error::UnsupportedAlgorithm(name.to_string())),
    };
    Ok(alg)
}

// =============================================================================
// Salted Hasher
// =============================================================================

/// Hashes blocks using the salting rule of a given format version.
#[derive(Clone)]
pub struct VerityHasher {
    algorithm: Arc<dyn DigestAlgorithm>,
    salt: Arc<[u8]>,
    version: u8,
}

impl fmt::Debug for VerityHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerityHasher")
            .field("algorithm", &self.algorithm.name())
            .field("salt_len", &self.salt.len())
            .field("version", &self.version)
            .finish()
    }
}

impl VerityHasher {
    /// Create a hasher for the given algorithm, salt and format version.
    pub fn new(algorithm: Arc<dyn DigestAlgorithm>, salt: &[u8], version: u8) -> Self {
        Self {
            algorithm,
            salt: Arc::from(salt),
            version,
        }
    }

    pub fn algorithm(&self) -> &Arc<dyn DigestAlgorithm> {
        &self.algorithm
    }

    pub fn digest_size(&self) -> usize {
        self.algorithm.digest_size()
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Begin an incremental hash. Version 1 and later feed the salt first.
    pub fn init(&self) -> HashState<'_> {
        let mut inner = self.algorithm.begin();
        if self.version >= 1 {
            inner.update(&self.salt);
        }
        HashState {
            inner,
            trailing_salt: (self.version == 0).then_some(&self.salt[..]),
        }
    }

    /// Hash a contiguous buffer.
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        let mut state = self.init();
        state.update(data);
        state.finalize()
    }

    /// Hash a contiguous buffer into `out`, which must be `digest_size` long.
    pub fn digest_into(&self, data: &[u8], out: &mut [u8]) {
        let mut state = self.init();
        state.update(data);
        state.finalize_into(out);
    }
}

/// An in-progress salted hash.
pub struct HashState<'a> {
    inner: Box<dyn DynDigest>,
    trailing_salt: Option<&'a [u8]>,
}

impl HashState<'_> {
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finish the hash. Version 0 appends the salt here.
    pub fn finalize(mut self) -> Vec<u8> {
        if let Some(salt) = self.trailing_salt {
            self.inner.update(salt);
        }
        self.inner.finalize().into_vec()
    }

    pub fn finalize_into(self, out: &mut [u8]) {
        let digest = self.finalize();
        out.copy_from_slice(&digest);
    }
}
