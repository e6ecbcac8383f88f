//! CasDigest: a full 32-byte BLAKE3 content digest.
//!
//! We use BLAKE3 for its speed. The digest is kept at the full 32 bytes
//! because digests here address whole object graphs shared between
//! machines, not just local files. An object's digest covers its reference
//! list as well as its payload, so two objects are interchangeable exactly
//! when their digests match.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Digest length in bytes.
pub const DIGEST_LEN: usize = 32;

/// A 32-byte BLAKE3 content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CasDigest([u8; DIGEST_LEN]);

/// Errors that can occur when working with digests.
#[derive(Debug, Error)]
pub enum DigestError {
    #[error("invalid digest length: expected {DIGEST_LEN} bytes, got {0}")]
    InvalidLength(usize),

    #[error("invalid hex in digest string")]
    InvalidHex,
}

impl CasDigest {
    /// Digest an object: reference count, then each reference digest in
    /// order, then the payload.
    ///
    /// Hashing the count first keeps reference bytes and payload bytes
    /// from being confusable with each other.
    pub fn of_object<'a>(refs: impl IntoIterator<Item = &'a CasDigest>, data: &[u8]) -> Self {
        let mut body = Vec::new();
        for r in refs {
            body.extend_from_slice(&r.0);
        }
        let count = (body.len() / DIGEST_LEN) as u64;

        let mut hasher = blake3::Hasher::new();
        hasher.update(&count.to_le_bytes());
        hasher.update(&body);
        hasher.update(data);
        Self(*hasher.finalize().as_bytes())
    }

    /// Digest a leaf object (no references).
    pub fn of_data(data: &[u8]) -> Self {
        Self::of_object([], data)
    }

    /// Wrap raw digest bytes.
    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Wrap a byte slice, validating its length.
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, DigestError> {
        let arr: [u8; DIGEST_LEN] = bytes
            .try_into()
            .map_err(|_| DigestError::InvalidLength(bytes.len()))?;
        Ok(Self(arr))
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

impl fmt::Display for CasDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for CasDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CasDigest({})", hex::encode(self.0))
    }
}

impl FromStr for CasDigest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != DIGEST_LEN * 2 {
            return Err(DigestError::InvalidLength(s.len() / 2));
        }
        let bytes = hex::decode(s).map_err(|_| DigestError::InvalidHex)?;
        Self::try_from_slice(&bytes)
    }
}

impl Serialize for CasDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for CasDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_content_same_digest() {
        let a = CasDigest::of_data(b"hello");
        let b = CasDigest::of_data(b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_content_different_digest() {
        assert_ne!(CasDigest::of_data(b"hello"), CasDigest::of_data(b"world"));
    }

    #[test]
    fn test_refs_are_part_of_the_digest() {
        let child = CasDigest::of_data(b"child");
        let with_ref = CasDigest::of_object([&child], b"payload");
        let without_ref = CasDigest::of_data(b"payload");
        assert_ne!(with_ref, without_ref);
    }

    #[test]
    fn test_ref_order_matters() {
        let a = CasDigest::of_data(b"a");
        let b = CasDigest::of_data(b"b");
        assert_ne!(
            CasDigest::of_object([&a, &b], b"x"),
            CasDigest::of_object([&b, &a], b"x")
        );
    }

    #[test]
    fn test_hex_roundtrip() {
        let d = CasDigest::of_data(b"roundtrip");
        let s = d.to_string();
        assert_eq!(s.len(), 64);
        assert_eq!(s.parse::<CasDigest>().unwrap(), d);
    }

    #[test]
    fn test_invalid_hex_rejected() {
        assert!(matches!(
            "not hex at all".parse::<CasDigest>(),
            Err(DigestError::InvalidLength(_))
        ));
        let bad = "z".repeat(64);
        assert!(matches!(
            bad.parse::<CasDigest>(),
            Err(DigestError::InvalidHex)
        ));
    }

    #[test]
    fn test_serde_as_hex_string() {
        let d = CasDigest::of_data(b"serde");
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{d}\""));
        let back: CasDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }
}
