//! Store interface shared by the legacy and structured backends.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::StoreError;
use crate::types::{
    AccountPickle, Credentials, DeviceInfo, DeviceTrackingStatuses, InboundGroupSessionRecord,
    IncomingKeyRequest, KeyRequestBody, OutgoingKeyRequest, SessionRecord,
};

/// Abstract interface over persisted crypto-session state.
///
/// Implementations must be thread-safe (`Send + Sync`); every method
/// takes `&self` and may be called concurrently from independent
/// threads. Lookups return `Ok(None)` (or an empty collection) when no
/// record matches — absence is never an error. Writes are idempotent
/// upserts unless documented otherwise.
///
/// Lifecycle is ownership-based: backends are opened with
/// `open(dir, credentials) -> Result<Self>` on the concrete type and
/// closed by `close(self)` or by dropping the handle, so a closed store
/// cannot be used again.
pub trait CryptoStore: Send + Sync {
    /// The credentials this store was opened with.
    fn credentials(&self) -> &Credentials;

    /// Whether any data is persisted on disk for this store.
    ///
    /// Returns `false` for a freshly created store and again after
    /// [`wipe`](Self::wipe).
    fn has_data(&self) -> Result<bool, StoreError>;

    /// Irreversibly delete all persisted data.
    fn wipe(&self) -> Result<(), StoreError>;

    // ---- Account ----

    /// Save the device's own pickled account. Replaces any previous one.
    fn save_account(&self, account: &AccountPickle) -> Result<(), StoreError>;

    /// Load the device's own pickled account.
    fn load_account(&self) -> Result<Option<AccountPickle>, StoreError>;

    // ---- Olm sessions ----

    /// Save a session with the device identified by `device_key`.
    fn save_session(&self, device_key: &str, session: &SessionRecord) -> Result<(), StoreError>;

    /// Load the session `(device_key, session_id)`.
    fn load_session(
        &self,
        device_key: &str,
        session_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError>;

    /// All session ids known for `device_key`.
    fn session_ids(&self, device_key: &str) -> Result<BTreeSet<String>, StoreError>;

    // ---- Megolm inbound group sessions ----

    /// Save an inbound group session.
    ///
    /// A record whose ratchet index is strictly older than the persisted
    /// one is ignored: the ratchet only moves forward.
    fn save_inbound_group_session(
        &self,
        session: &InboundGroupSessionRecord,
    ) -> Result<(), StoreError>;

    /// Load the inbound group session `(sender_key, session_id)`.
    fn load_inbound_group_session(
        &self,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<InboundGroupSessionRecord>, StoreError>;

    /// All stored inbound group sessions.
    fn inbound_group_sessions(&self) -> Result<Vec<InboundGroupSessionRecord>, StoreError>;

    // ---- Room settings ----

    /// Record the encryption algorithm configured for a room.
    fn save_room_algorithm(&self, room_id: &str, algorithm: &str) -> Result<(), StoreError>;

    /// The encryption algorithm configured for a room, if any.
    fn room_algorithm(&self, room_id: &str) -> Result<Option<String>, StoreError>;

    /// Replace the set of rooms that withhold keys from unverified
    /// devices.
    fn set_blacklist_unverified_rooms(&self, room_ids: &[String]) -> Result<(), StoreError>;

    /// Rooms that withhold keys from unverified devices, sorted.
    fn blacklist_unverified_rooms(&self) -> Result<Vec<String>, StoreError>;

    // ---- User devices ----

    /// Save metadata for one of a user's devices.
    fn save_user_device(&self, user_id: &str, device: &DeviceInfo) -> Result<(), StoreError>;

    /// Load the device `(user_id, device_id)`.
    fn load_user_device(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<DeviceInfo>, StoreError>;

    /// All known devices of a user, by device id.
    fn user_devices(&self, user_id: &str) -> Result<BTreeMap<String, DeviceInfo>, StoreError>;

    /// Replace the device-list tracking statuses.
    fn save_device_tracking_statuses(
        &self,
        statuses: &DeviceTrackingStatuses,
    ) -> Result<(), StoreError>;

    /// The device-list tracking statuses, by user id.
    fn device_tracking_statuses(&self) -> Result<DeviceTrackingStatuses, StoreError>;

    // ---- Outgoing room key requests ----

    /// Insert an outgoing request, or return the existing record with an
    /// equal body.
    ///
    /// Atomic with respect to the one-record-per-body invariant:
    /// concurrent callers racing on the same body all observe the same
    /// single record.
    fn get_or_add_outgoing_key_request(
        &self,
        request: OutgoingKeyRequest,
    ) -> Result<OutgoingKeyRequest, StoreError>;

    /// Look up an outgoing request by its body.
    fn outgoing_key_request(
        &self,
        body: &KeyRequestBody,
    ) -> Result<Option<OutgoingKeyRequest>, StoreError>;

    // ---- Incoming room key requests ----

    /// Save a request received from another device.
    fn save_incoming_key_request(&self, request: &IncomingKeyRequest) -> Result<(), StoreError>;

    /// Load the incoming request `(user_id, device_id, request_id)`.
    fn incoming_key_request(
        &self,
        user_id: &str,
        device_id: &str,
        request_id: &str,
    ) -> Result<Option<IncomingKeyRequest>, StoreError>;

    /// All incoming requests not yet actioned.
    fn pending_incoming_key_requests(&self) -> Result<Vec<IncomingKeyRequest>, StoreError>;

    /// Remove an incoming request once it has been shared or rejected.
    fn delete_incoming_key_request(
        &self,
        user_id: &str,
        device_id: &str,
        request_id: &str,
    ) -> Result<(), StoreError>;
}
