//! Record types persisted by the crypto store.
//!
//! Cryptographic objects cross into this layer only in pickled form; the
//! ratchet internals are owned by the crypto subsystem. The store may
//! index on a session's identifier, its sender/device key, and its
//! ratchet index, and treats everything else as opaque.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// The `(user_id, device_id)` pair every store is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user_id: String,
    pub device_id: String,
}

impl Credentials {
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
        }
    }
}

/// The device's own pickled Olm account. One per store.
///
/// The pickle is key material in serialized form and is zeroized when
/// the value is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct AccountPickle {
    pub pickle: String,
}

impl AccountPickle {
    pub fn new(pickle: impl Into<String>) -> Self {
        Self {
            pickle: pickle.into(),
        }
    }
}

/// A single pickled Olm session with a remote device.
///
/// Keyed by `(device_key, session_id)`; the device key is supplied at
/// the call site since one device may hold many sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Olm session identifier.
    pub session_id: String,
    /// Serialized session state.
    pub pickle: String,
}

/// A pickled Megolm inbound group session.
///
/// Keyed by `(sender_key, session_id)`. `message_index` is the ratchet
/// index of the pickled state; it only ever moves forward, and stores
/// carrying an older index than the persisted one are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundGroupSessionRecord {
    /// Curve25519 key of the sending device.
    pub sender_key: String,
    /// Megolm session identifier.
    pub session_id: String,
    /// Ratchet index of the pickled state (monotonic).
    pub message_index: u32,
    /// Serialized session state.
    pub pickle: String,
}

/// Verification state of a remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceVerification {
    Unverified,
    Verified,
    Blocked,
}

impl Default for DeviceVerification {
    fn default() -> Self {
        DeviceVerification::Unverified
    }
}

/// Metadata and verification state for a remote device.
///
/// Keyed by `(user_id, device_id)`; the user id is supplied at the call
/// site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    /// Identity keys by algorithm label, e.g. `"curve25519:DEVICEID"`.
    #[serde(default)]
    pub keys: BTreeMap<String, String>,
    /// Encryption algorithms the device supports.
    #[serde(default)]
    pub algorithms: Vec<String>,
    #[serde(default)]
    pub verification: DeviceVerification,
}

/// Device-list tracking status per user, as recorded by the sync layer.
pub type DeviceTrackingStatuses = BTreeMap<String, i32>;

/// The parameters of a requested room key.
///
/// Two outgoing requests with equal bodies are the same logical request;
/// the canonical encoding of this struct is the dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRequestBody {
    pub algorithm: String,
    pub room_id: String,
    pub sender_key: String,
    pub session_id: String,
}

/// Lifecycle state of an outgoing room key request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyRequestState {
    /// Queued, not yet sent.
    Unsent,
    /// Sent, awaiting a reply.
    Sent,
    /// A cancellation is queued.
    CancellationPending,
    /// A cancellation is queued and the request will be re-sent after it.
    CancellationPendingAndWillResend,
    /// Cancelled; kept only until the cancellation is acknowledged.
    Cancelled,
}

/// A device the request is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecipient {
    pub user_id: String,
    pub device_id: String,
}

/// A room key request issued by this client.
///
/// At most one record exists per distinct body value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingKeyRequest {
    pub request_id: String,
    pub recipients: Vec<RequestRecipient>,
    pub body: KeyRequestBody,
    pub state: KeyRequestState,
    /// Transaction id of the cancellation, once one is issued.
    #[serde(default)]
    pub cancellation_txn_id: Option<String>,
}

/// A room key request received from another device.
///
/// Keyed by `(user_id, device_id, request_id)`; deleted once the request
/// has been shared or rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingKeyRequest {
    pub user_id: String,
    pub device_id: String,
    pub request_id: String,
    pub body: KeyRequestBody,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_info_defaults_apply_on_sparse_input() {
        let info: DeviceInfo = serde_json::from_str(r#"{"device_id":"DEV1"}"#).unwrap();
        assert_eq!(info.device_id, "DEV1");
        assert!(info.keys.is_empty());
        assert!(info.algorithms.is_empty());
        assert_eq!(info.verification, DeviceVerification::Unverified);
    }

    #[test]
    fn equal_bodies_compare_equal() {
        let a = KeyRequestBody {
            algorithm: "m.megolm.v1.aes-sha2".into(),
            room_id: "!room:example.org".into(),
            sender_key: "sender_key_1".into(),
            session_id: "session_1".into(),
        };
        let b = a.clone();
        assert_eq!(a, b);
    }
}
