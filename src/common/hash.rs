//! Hashing utilities for slotctl
//!
//! Topologies are compared by a BLAKE3 digest of their canonical JSON
//! encoding. Every map in the encoded types is a `BTreeMap`, so the encoding
//! (and the digest) does not depend on insertion order.

use serde::Serialize;

/// Compute BLAKE3 hash of data, return hex string
pub fn blake3_hash(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    format!("{}", hash)
}

/// BLAKE3 digest of a value's JSON encoding
pub fn fingerprint<T: Serialize>(value: &T) -> crate::Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(blake3_hash(&bytes))
}

/// First 12 hex chars, for log lines
pub fn short(fingerprint: &str) -> &str {
    let end = fingerprint.len().min(12);
    &fingerprint[..end]
}
