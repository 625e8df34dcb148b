//! Cryptographic digest type using Blake3.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 32-byte cryptographic digest using Blake3.
///
/// Used to detect equivocation: two proposals with the same digest are the
/// same proposal. Safe to use as a map key; all hashing is deterministic.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Size of the digest in bytes.
    pub const BYTES: usize = 32;

    /// Zero digest (all bytes are 0x00).
    pub const ZERO: Self = Self([0u8; 32]);

    /// Digest a single byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let hash = blake3::hash(bytes);
        Self(*hash.as_bytes())
    }

    /// Digest multiple byte slices.
    ///
    /// Each part is prefixed with its length so that `["ab", "c"]` and
    /// `["a", "bc"]` produce different digests.
    pub fn from_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Self(*hasher.finalize().as_bytes())
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex representation of the full digest.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short prefix is enough to tell digests apart in logs.
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..")
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let a = Digest::from_bytes(b"hello");
        let b = Digest::from_bytes(b"hello");
        assert_eq!(a, b);
        assert_ne!(a, Digest::from_bytes(b"world"));
    }

    #[test]
    fn parts_are_length_framed() {
        let a = Digest::from_parts(&[b"ab", b"c"]);
        let b = Digest::from_parts(&[b"a", b"bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn hex_round_trip_length() {
        let d = Digest::from_bytes(b"x");
        assert_eq!(d.to_hex().len(), 64);
    }
}
