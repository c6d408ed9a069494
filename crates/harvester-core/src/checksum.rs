//! Stable content hashing.
//!
//! Payloads are hashed through `serde_json::Value`, whose object maps keep
//! keys sorted, so two payloads with the same logical content but a
//! different key order produce the same digest.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// SHA-256 hex digest of the canonical JSON form of `value`.
pub fn checksum<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<String> {
    let canonical = serde_json::to_value(value)?;
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(checksum_bytes(&bytes))
}

pub fn checksum_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
