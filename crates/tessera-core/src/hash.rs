//! Pure synchronous hashing for ledger digests
//!
//! Hashing is deterministic and side-effect free, so it lives here rather than
//! behind an effect interface. Every digest in the workspace (replica log
//! chains, visible-transaction fingerprints, key hints) goes through [`hash`]
//! or [`hasher`] so the algorithm is declared in exactly one place.
//!
//! Current algorithm: **SHA-256** (32-byte output)

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// 32-byte digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Hash32(pub [u8; 32]);

impl Hash32 {
    /// The all-zero digest, used as the genesis link of hash chains.
    pub const ZERO: Hash32 = Hash32([0u8; 32]);

    /// Wrap raw digest bytes.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash arbitrary bytes.
    pub fn of(data: &[u8]) -> Self {
        Self(hash(data))
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lower-case hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Incremental hasher over the global algorithm.
pub struct Hasher(Sha256);

impl Hasher {
    /// Update the hasher with more data
    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.0.update(data);
        self
    }

    /// Finalize into a digest
    pub fn finalize(self) -> Hash32 {
        let result = self.0.finalize();
        let mut output = [0u8; 32];
        output.copy_from_slice(&result);
        Hash32(output)
    }
}

/// Hash bytes with the global algorithm.
#[inline]
pub fn hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut output = [0u8; 32];
    output.copy_from_slice(&result);
    output
}

/// Create an incremental hasher with the global algorithm.
#[inline]
pub fn hasher() -> Hasher {
    Hasher(Sha256::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        assert_eq!(hash(b"ledger"), hash(b"ledger"));
        assert_ne!(hash(b"ledger"), hash(b"ledgers"));
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let mut h = hasher();
        h.update(b"public").update(b":").update(b"private");
        assert_eq!(h.finalize(), Hash32::of(b"public:private"));
    }

    #[test]
    fn test_hex_roundtrip_length() {
        assert_eq!(Hash32::of(b"x").to_hex().len(), 64);
        assert_eq!(Hash32::ZERO.to_hex(), "0".repeat(64));
    }
}
