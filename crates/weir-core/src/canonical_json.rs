//! Canonical JSON serialization for deterministic composite payloads.
//!
//! The composite builder must produce byte-identical output for the same
//! final member set regardless of arrival order — re-emission after a crash
//! between close and publish depends on it, and so does deduplication by
//! content. Canonical form here means:
//!
//! - Object keys sorted lexicographically (UTF-8 byte order), recursively
//! - Compact output (no whitespace)
//! - UTF-8 encoding
//!
//! Non-finite numbers are unrepresentable in JSON and rejected upstream by
//! `serde_json`; no additional numeric policy is imposed on the free-form
//! attribute values carried by composite nodes and edges.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors that can occur during canonical JSON serialization.
#[derive(Debug, Error)]
pub enum CanonicalJsonError {
    /// Serde JSON conversion failed.
    #[error("serde_json error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Serializes `value` into canonical JSON bytes.
///
/// # Errors
///
/// Returns `CanonicalJsonError::Serde` if the value cannot be represented as
/// JSON.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonicalJsonError> {
    let value = serde_json::to_value(value)?;
    let sorted = sort_value(value);
    Ok(serde_json::to_vec(&sorted)?)
}

/// Serializes `value` into a canonical JSON string.
///
/// # Errors
///
/// Returns `CanonicalJsonError::Serde` if the value cannot be represented as
/// JSON.
pub fn to_canonical_string<T: Serialize>(value: &T) -> Result<String, CanonicalJsonError> {
    let bytes = to_canonical_bytes(value)?;
    // to_canonical_bytes always produces valid UTF-8 JSON.
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Recursively sorts object keys.
///
/// `serde_json::Map` backed by `BTreeMap` would sort top-level keys on its
/// own, but nested maps arriving through `Value::Object` preserve insertion
/// order unless rebuilt — so the rebuild is done explicitly at every level.
fn sort_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k, sort_value(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_value).collect()),
        other => other,
    }
}
