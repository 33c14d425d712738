//! Content hashing for change detection.

use std::fmt;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::feature::FeatureContent;

/// Seed keying the content hash.
pub const CONTENT_HASH_SEED: u64 = 0x726f_6164_7379_6e63;

/// Stable fingerprint of a feature's exportable content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub u64);

/// Error raised when content cannot be encoded for hashing.
#[derive(Debug, thiserror::Error)]
#[error("failed to encode feature content for hashing")]
pub struct HashError {
    #[source]
    source: bincode::Error,
}

impl ContentHash {
    /// Hash the canonical binary encoding of `content`.
    ///
    /// # Errors
    ///
    /// Returns [`HashError`] when the content cannot be encoded.
    pub fn of(content: &FeatureContent) -> Result<Self, HashError> {
        let bytes = bincode::serialize(content).map_err(|source| HashError { source })?;
        Ok(Self(xxh3_64_with_seed(&bytes, CONTENT_HASH_SEED)))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
