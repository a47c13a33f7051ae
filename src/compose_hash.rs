//! Deterministic app-compose hashing.
//!
//! The compose hash binds a running CVM to the exact deployment manifest it
//! was launched with: the measured environment extends RTMR3 with a
//! `compose-hash` event whose payload is the SHA-256 of the canonicalized
//! app-compose document. The canonicalization here (sorted keys, compact
//! separators, UTF-8) must stay byte-compatible with the Python and
//! TypeScript implementations.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::VerificationError;

/// Recursively sort JSON object keys for deterministic output.
fn sort_object(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: serde_json::Map<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, sort_object(v)))
                .collect::<BTreeMap<_, _>>()
                .into_iter()
                .collect();
            Value::Object(sorted)
        }
        Value::Array(arr) => Value::Array(arr.into_iter().map(sort_object).collect()),
        other => other,
    }
}

/// Compute the deterministic SHA-256 of an app-compose document.
///
/// Returns the raw 32-byte digest; use [`compose_hash_hex`] for the
/// lowercase hex form recorded in event logs.
pub fn compose_hash(app_compose: &Value) -> Result<[u8; 32], VerificationError> {
    let sorted = sort_object(app_compose.clone());
    let json_str = serde_json::to_string(&sorted)
        .map_err(|e| VerificationError::Configuration(format!("unserializable compose: {e}")))?;
    Ok(Sha256::digest(json_str.as_bytes()).into())
}

/// Hex form of [`compose_hash`].
pub fn compose_hash_hex(app_compose: &Value) -> Result<String, VerificationError> {
    compose_hash(app_compose).map(hex::encode)
}
