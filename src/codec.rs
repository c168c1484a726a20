//! Serialization codec for persisted records.
//!
//! Records round-trip through JSON. Decoding is deliberately forgiving:
//! a missing, empty, or corrupt blob decodes to `None` so a single bad
//! record never takes down the whole store — callers re-derive or
//! renegotiate instead. Neither direction ever puts record contents
//! (pickled key material included) into an error or a log line.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;
use crate::types::KeyRequestBody;

/// Encode a record for storage.
pub fn encode<T: Serialize>(value: &T) -> Result<String, StoreError> {
    // Only the error category is surfaced; the payload stays out of the
    // error message.
    serde_json::to_string(value)
        .map_err(|e| StoreError::Serialization(format!("encode: {:?} error", e.classify())))
}

/// Decode a stored blob, treating absent, empty, and corrupt input as
/// "no record".
pub fn decode<T: DeserializeOwned>(blob: Option<&str>) -> Option<T> {
    let blob = blob?;
    if blob.is_empty() {
        return None;
    }
    serde_json::from_str(blob).ok()
}

/// Canonical dedup key for an outgoing request body.
///
/// Field order is fixed by the struct definition, so equal bodies always
/// produce identical keys.
pub fn body_key(body: &KeyRequestBody) -> String {
    // Encoding a plain struct of strings cannot fail.
    serde_json::to_string(body).unwrap_or_default()
}
