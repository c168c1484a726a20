//! Legacy flat-file store.
//!
//! The whole store lives in memory behind one mutex; each entity group
//! persists as a single JSON file that is rewritten as a unit whenever a
//! record in that group changes. Files are replaced via
//! write-to-temp + rename, so a crash mid-flush loses at most the
//! mutation being written and never corrupts another entity group.
//!
//! This backend exists so existing installations keep working and so the
//! migration coordinator can enumerate everything it holds; new
//! installations should use [`SqliteCryptoStore`](crate::SqliteCryptoStore).

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec;
use crate::error::StoreError;
use crate::store::CryptoStore;
use crate::types::{
    AccountPickle, Credentials, DeviceInfo, DeviceTrackingStatuses, InboundGroupSessionRecord,
    IncomingKeyRequest, KeyRequestBody, OutgoingKeyRequest, SessionRecord,
};

const METADATA_FILE: &str = "metadata.json";
const ACCOUNT_FILE: &str = "account.json";
const SESSIONS_FILE: &str = "sessions.json";
const GROUP_SESSIONS_FILE: &str = "inbound_group_sessions.json";
const ROOMS_FILE: &str = "rooms.json";
const DEVICES_FILE: &str = "devices.json";
const OUTGOING_FILE: &str = "outgoing_requests.json";
const INCOMING_FILE: &str = "incoming_requests.json";

/// Entity files that count as "data". Metadata is bookkeeping only, so a
/// freshly opened store still reports `has_data() == false`.
const ENTITY_FILES: [&str; 7] = [
    ACCOUNT_FILE,
    SESSIONS_FILE,
    GROUP_SESSIONS_FILE,
    ROOMS_FILE,
    DEVICES_FILE,
    OUTGOING_FILE,
    INCOMING_FILE,
];

/// Per-room settings as kept by this backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct FileRoomSettings {
    pub algorithm: Option<String>,
    #[serde(default)]
    pub blacklist_unverified_devices: bool,
}

/// The store's complete in-memory contents.
///
/// Nested maps mirror the composite keys of each entity:
/// `sessions[device_key][session_id]`, and so on. Outgoing requests are
/// keyed by the canonical encoding of their body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct FileStoreContents {
    pub account: Option<AccountPickle>,
    pub sessions: BTreeMap<String, BTreeMap<String, SessionRecord>>,
    pub inbound_group_sessions: BTreeMap<String, BTreeMap<String, InboundGroupSessionRecord>>,
    pub rooms: BTreeMap<String, FileRoomSettings>,
    pub devices: BTreeMap<String, BTreeMap<String, DeviceInfo>>,
    pub tracking_statuses: DeviceTrackingStatuses,
    pub outgoing_requests: BTreeMap<String, OutgoingKeyRequest>,
    pub incoming_requests: BTreeMap<String, IncomingKeyRequest>,
}

fn incoming_key(user_id: &str, device_id: &str, request_id: &str) -> String {
    format!("{}\u{0}{}\u{0}{}", user_id, device_id, request_id)
}

/// File-backed legacy store.
pub struct FileCryptoStore {
    dir: PathBuf,
    credentials: Credentials,
    state: Mutex<FileStoreContents>,
}

impl FileCryptoStore {
    /// Open (or create) the legacy store in `dir` for `credentials`.
    ///
    /// If the directory already holds data recorded under different
    /// credentials, that stale data is wiped before the store is
    /// returned.
    pub fn open(dir: impl AsRef<Path>, credentials: Credentials) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let store = Self {
            dir,
            credentials,
            state: Mutex::new(FileStoreContents::default()),
        };

        let recorded: Option<Credentials> = codec::decode(read_blob(&store.dir, METADATA_FILE)?.as_deref());
        match recorded {
            Some(ref c) if *c != store.credentials => {
                warn!("file store credentials changed, wiping stale data");
                store.wipe()?;
            }
            _ => {}
        }

        store.load_all()?;
        store.write_group(METADATA_FILE, &store.credentials)?;
        debug!(path = %store.dir.display(), "opened file crypto store");
        Ok(store)
    }

    /// Whether `dir` holds legacy store data, without opening it.
    pub fn exists(dir: impl AsRef<Path>) -> bool {
        let dir = dir.as_ref();
        ENTITY_FILES.iter().any(|name| dir.join(name).exists())
    }

    /// Consume and close the store. Data stays on disk.
    pub fn close(self) {}

    /// Clone of the complete contents, for migration enumeration.
    pub(crate) fn snapshot(&self) -> FileStoreContents {
        self.state.lock().unwrap().clone()
    }

    fn load_all(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.account = codec::decode(read_blob(&self.dir, ACCOUNT_FILE)?.as_deref());
        state.sessions =
            codec::decode(read_blob(&self.dir, SESSIONS_FILE)?.as_deref()).unwrap_or_default();
        state.inbound_group_sessions =
            codec::decode(read_blob(&self.dir, GROUP_SESSIONS_FILE)?.as_deref()).unwrap_or_default();
        state.rooms =
            codec::decode(read_blob(&self.dir, ROOMS_FILE)?.as_deref()).unwrap_or_default();
        let devices: Option<DeviceGroup> = codec::decode(read_blob(&self.dir, DEVICES_FILE)?.as_deref());
        if let Some(devices) = devices {
            state.devices = devices.devices;
            state.tracking_statuses = devices.tracking_statuses;
        }
        state.outgoing_requests =
            codec::decode(read_blob(&self.dir, OUTGOING_FILE)?.as_deref()).unwrap_or_default();
        state.incoming_requests =
            codec::decode(read_blob(&self.dir, INCOMING_FILE)?.as_deref()).unwrap_or_default();
        Ok(())
    }

    /// Rewrite one entity-group file as a whole unit.
    ///
    /// Callers hold the state mutex, so flushes of the same group never
    /// interleave.
    fn write_group<T: Serialize>(&self, name: &str, value: &T) -> Result<(), StoreError> {
        let blob = codec::encode(value)?;
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{}.tmp", name));
        fs::write(&tmp, blob.as_bytes())?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn flush_devices(&self, state: &FileStoreContents) -> Result<(), StoreError> {
        self.write_group(
            DEVICES_FILE,
            &DeviceGroup {
                devices: state.devices.clone(),
                tracking_statuses: state.tracking_statuses.clone(),
            },
        )
    }
}

/// Devices and tracking statuses share one entity-group file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DeviceGroup {
    devices: BTreeMap<String, BTreeMap<String, DeviceInfo>>,
    #[serde(default)]
    tracking_statuses: DeviceTrackingStatuses,
}

fn read_blob(dir: &Path, name: &str) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(dir.join(name)) {
        Ok(blob) => Ok(Some(blob)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl CryptoStore for FileCryptoStore {
    fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    fn has_data(&self) -> Result<bool, StoreError> {
        Ok(Self::exists(&self.dir))
    }

    fn wipe(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        for name in ENTITY_FILES.iter().chain([METADATA_FILE].iter()) {
            let path = self.dir.join(name);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        *state = FileStoreContents::default();
        debug!(path = %self.dir.display(), "wiped file crypto store");
        Ok(())
    }

    fn save_account(&self, account: &AccountPickle) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.account = Some(account.clone());
        self.write_group(ACCOUNT_FILE, &state.account)
    }

    fn load_account(&self) -> Result<Option<AccountPickle>, StoreError> {
        Ok(self.state.lock().unwrap().account.clone())
    }

    fn save_session(&self, device_key: &str, session: &SessionRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state
            .sessions
            .entry(device_key.to_string())
            .or_default()
            .insert(session.session_id.clone(), session.clone());
        self.write_group(SESSIONS_FILE, &state.sessions)
    }

    fn load_session(
        &self,
        device_key: &str,
        session_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .sessions
            .get(device_key)
            .and_then(|by_id| by_id.get(session_id))
            .cloned())
    }

    fn session_ids(&self, device_key: &str) -> Result<BTreeSet<String>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .sessions
            .get(device_key)
            .map(|by_id| by_id.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn save_inbound_group_session(
        &self,
        session: &InboundGroupSessionRecord,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let by_id = state
            .inbound_group_sessions
            .entry(session.sender_key.clone())
            .or_default();
        if let Some(existing) = by_id.get(&session.session_id) {
            // The ratchet only moves forward; keep the newer state.
            if existing.message_index > session.message_index {
                return Ok(());
            }
        }
        by_id.insert(session.session_id.clone(), session.clone());
        self.write_group(GROUP_SESSIONS_FILE, &state.inbound_group_sessions)
    }

    fn load_inbound_group_session(
        &self,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<InboundGroupSessionRecord>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .inbound_group_sessions
            .get(sender_key)
            .and_then(|by_id| by_id.get(session_id))
            .cloned())
    }

    fn inbound_group_sessions(&self) -> Result<Vec<InboundGroupSessionRecord>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .inbound_group_sessions
            .values()
            .flat_map(|by_id| by_id.values().cloned())
            .collect())
    }

    fn save_room_algorithm(&self, room_id: &str, algorithm: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state
            .rooms
            .entry(room_id.to_string())
            .or_default()
            .algorithm = Some(algorithm.to_string());
        self.write_group(ROOMS_FILE, &state.rooms)
    }

    fn room_algorithm(&self, room_id: &str) -> Result<Option<String>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.rooms.get(room_id).and_then(|r| r.algorithm.clone()))
    }

    fn set_blacklist_unverified_rooms(&self, room_ids: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        for settings in state.rooms.values_mut() {
            settings.blacklist_unverified_devices = false;
        }
        for room_id in room_ids {
            state
                .rooms
                .entry(room_id.clone())
                .or_default()
                .blacklist_unverified_devices = true;
        }
        self.write_group(ROOMS_FILE, &state.rooms)
    }

    fn blacklist_unverified_rooms(&self) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .rooms
            .iter()
            .filter(|(_, s)| s.blacklist_unverified_devices)
            .map(|(room_id, _)| room_id.clone())
            .collect())
    }

    fn save_user_device(&self, user_id: &str, device: &DeviceInfo) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state
            .devices
            .entry(user_id.to_string())
            .or_default()
            .insert(device.device_id.clone(), device.clone());
        self.flush_devices(&state)
    }

    fn load_user_device(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<DeviceInfo>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .devices
            .get(user_id)
            .and_then(|by_id| by_id.get(device_id))
            .cloned())
    }

    fn user_devices(&self, user_id: &str) -> Result<BTreeMap<String, DeviceInfo>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.devices.get(user_id).cloned().unwrap_or_default())
    }

    fn save_device_tracking_statuses(
        &self,
        statuses: &DeviceTrackingStatuses,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.tracking_statuses = statuses.clone();
        self.flush_devices(&state)
    }

    fn device_tracking_statuses(&self) -> Result<DeviceTrackingStatuses, StoreError> {
        Ok(self.state.lock().unwrap().tracking_statuses.clone())
    }

    fn get_or_add_outgoing_key_request(
        &self,
        request: OutgoingKeyRequest,
    ) -> Result<OutgoingKeyRequest, StoreError> {
        let mut state = self.state.lock().unwrap();
        let key = codec::body_key(&request.body);
        if let Some(existing) = state.outgoing_requests.get(&key) {
            return Ok(existing.clone());
        }
        state.outgoing_requests.insert(key, request.clone());
        self.write_group(OUTGOING_FILE, &state.outgoing_requests)?;
        Ok(request)
    }

    fn outgoing_key_request(
        &self,
        body: &KeyRequestBody,
    ) -> Result<Option<OutgoingKeyRequest>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.outgoing_requests.get(&codec::body_key(body)).cloned())
    }

    fn save_incoming_key_request(&self, request: &IncomingKeyRequest) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let key = incoming_key(&request.user_id, &request.device_id, &request.request_id);
        state.incoming_requests.insert(key, request.clone());
        self.write_group(INCOMING_FILE, &state.incoming_requests)
    }

    fn incoming_key_request(
        &self,
        user_id: &str,
        device_id: &str,
        request_id: &str,
    ) -> Result<Option<IncomingKeyRequest>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .incoming_requests
            .get(&incoming_key(user_id, device_id, request_id))
            .cloned())
    }

    fn pending_incoming_key_requests(&self) -> Result<Vec<IncomingKeyRequest>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.incoming_requests.values().cloned().collect())
    }

    fn delete_incoming_key_request(
        &self,
        user_id: &str,
        device_id: &str,
        request_id: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state
            .incoming_requests
            .remove(&incoming_key(user_id, device_id, request_id));
        self.write_group(INCOMING_FILE, &state.incoming_requests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeviceVerification, KeyRequestState};

    fn creds() -> Credentials {
        Credentials::new("@alice:example.org", "ALICEDEVICE")
    }

    fn body(session_id: &str) -> KeyRequestBody {
        KeyRequestBody {
            algorithm: "m.megolm.v1.aes-sha2".into(),
            room_id: "!room:example.org".into(),
            sender_key: "sender_key".into(),
            session_id: session_id.into(),
        }
    }

    #[test]
    fn fresh_store_has_no_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCryptoStore::open(dir.path(), creds()).unwrap();
        assert!(!store.has_data().unwrap());
        assert!(store.load_account().unwrap().is_none());
    }

    #[test]
    fn account_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileCryptoStore::open(dir.path(), creds()).unwrap();
            store
                .save_account(&AccountPickle::new("pickled-account"))
                .unwrap();
            assert!(store.has_data().unwrap());
        }

        let store = FileCryptoStore::open(dir.path(), creds()).unwrap();
        let account = store.load_account().unwrap().unwrap();
        assert_eq!(account.pickle, "pickled-account");
    }

    #[test]
    fn sessions_are_keyed_by_device_and_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCryptoStore::open(dir.path(), creds()).unwrap();

        store
            .save_session(
                "device_key_1",
                &SessionRecord {
                    session_id: "s1".into(),
                    pickle: "p1".into(),
                },
            )
            .unwrap();
        store
            .save_session(
                "device_key_1",
                &SessionRecord {
                    session_id: "s2".into(),
                    pickle: "p2".into(),
                },
            )
            .unwrap();

        let loaded = store.load_session("device_key_1", "s2").unwrap().unwrap();
        assert_eq!(loaded.pickle, "p2");
        assert!(store.load_session("device_key_2", "s1").unwrap().is_none());

        let ids = store.session_ids("device_key_1").unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("s1") && ids.contains("s2"));
    }

    #[test]
    fn older_ratchet_index_does_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCryptoStore::open(dir.path(), creds()).unwrap();

        let mut session = InboundGroupSessionRecord {
            sender_key: "sender".into(),
            session_id: "megolm1".into(),
            message_index: 5,
            pickle: "at-5".into(),
        };
        store.save_inbound_group_session(&session).unwrap();

        session.message_index = 3;
        session.pickle = "at-3".into();
        store.save_inbound_group_session(&session).unwrap();

        let stored = store
            .load_inbound_group_session("sender", "megolm1")
            .unwrap()
            .unwrap();
        assert_eq!(stored.message_index, 5);
        assert_eq!(stored.pickle, "at-5");

        session.message_index = 9;
        session.pickle = "at-9".into();
        store.save_inbound_group_session(&session).unwrap();
        let stored = store
            .load_inbound_group_session("sender", "megolm1")
            .unwrap()
            .unwrap();
        assert_eq!(stored.message_index, 9);
    }

    #[test]
    fn room_settings_upsert_and_blacklist() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCryptoStore::open(dir.path(), creds()).unwrap();

        store.save_room_algorithm("!r1", "algo1").unwrap();
        store.save_room_algorithm("!r1", "algo1").unwrap();
        store.save_room_algorithm("!r2", "algo2").unwrap();

        assert_eq!(store.room_algorithm("!r1").unwrap().unwrap(), "algo1");
        assert!(store.room_algorithm("!r3").unwrap().is_none());

        store
            .set_blacklist_unverified_rooms(&["!r2".to_string()])
            .unwrap();
        assert_eq!(store.blacklist_unverified_rooms().unwrap(), vec!["!r2"]);

        // Blacklisting must not disturb the stored algorithm.
        assert_eq!(store.room_algorithm("!r2").unwrap().unwrap(), "algo2");

        store
            .set_blacklist_unverified_rooms(&["!r1".to_string()])
            .unwrap();
        assert_eq!(store.blacklist_unverified_rooms().unwrap(), vec!["!r1"]);
    }

    #[test]
    fn user_devices_upsert_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCryptoStore::open(dir.path(), creds()).unwrap();

        let device = DeviceInfo {
            device_id: "BOBDEVICE".into(),
            keys: [("curve25519:BOBDEVICE".to_string(), "key".to_string())]
                .into_iter()
                .collect(),
            algorithms: vec!["m.olm.v1.curve25519-aes-sha2".into()],
            verification: DeviceVerification::Verified,
        };
        store.save_user_device("@bob:example.org", &device).unwrap();
        store.save_user_device("@bob:example.org", &device).unwrap();

        let devices = store.user_devices("@bob:example.org").unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(
            devices.get("BOBDEVICE").unwrap().verification,
            DeviceVerification::Verified
        );
    }

    #[test]
    fn outgoing_request_dedup_by_body() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCryptoStore::open(dir.path(), creds()).unwrap();

        let first = OutgoingKeyRequest {
            request_id: "req1".into(),
            recipients: vec![],
            body: body("megolm1"),
            state: KeyRequestState::Unsent,
            cancellation_txn_id: None,
        };
        let stored = store.get_or_add_outgoing_key_request(first.clone()).unwrap();
        assert_eq!(stored.request_id, "req1");

        // Same body, different request id: the existing record wins.
        let mut second = first.clone();
        second.request_id = "req2".into();
        let stored = store.get_or_add_outgoing_key_request(second).unwrap();
        assert_eq!(stored.request_id, "req1");

        // Different body: a second record.
        let mut third = first;
        third.request_id = "req3".into();
        third.body = body("megolm2");
        let stored = store.get_or_add_outgoing_key_request(third).unwrap();
        assert_eq!(stored.request_id, "req3");

        assert_eq!(
            store
                .outgoing_key_request(&body("megolm1"))
                .unwrap()
                .unwrap()
                .request_id,
            "req1"
        );
    }

    #[test]
    fn incoming_requests_are_removed_once_actioned() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCryptoStore::open(dir.path(), creds()).unwrap();

        let request = IncomingKeyRequest {
            user_id: "@bob:example.org".into(),
            device_id: "BOBDEVICE".into(),
            request_id: "in1".into(),
            body: body("megolm1"),
        };
        store.save_incoming_key_request(&request).unwrap();

        assert_eq!(store.pending_incoming_key_requests().unwrap().len(), 1);
        assert!(store
            .incoming_key_request("@bob:example.org", "BOBDEVICE", "in1")
            .unwrap()
            .is_some());

        store
            .delete_incoming_key_request("@bob:example.org", "BOBDEVICE", "in1")
            .unwrap();
        assert!(store.pending_incoming_key_requests().unwrap().is_empty());
    }

    #[test]
    fn wipe_removes_backing_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCryptoStore::open(dir.path(), creds()).unwrap();
        store.save_account(&AccountPickle::new("pickle")).unwrap();
        assert!(store.has_data().unwrap());
        assert!(FileCryptoStore::exists(dir.path()));

        store.wipe().unwrap();
        assert!(!store.has_data().unwrap());
        assert!(!FileCryptoStore::exists(dir.path()));
        assert!(store.load_account().unwrap().is_none());
    }

    #[test]
    fn credential_change_wipes_stale_data() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileCryptoStore::open(dir.path(), creds()).unwrap();
            store.save_account(&AccountPickle::new("pickle")).unwrap();
        }

        let other = Credentials::new("@mallory:example.org", "OTHERDEVICE");
        let store = FileCryptoStore::open(dir.path(), other).unwrap();
        assert!(store.load_account().unwrap().is_none());
        assert!(!store.has_data().unwrap());
    }

    #[test]
    fn corrupt_entity_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileCryptoStore::open(dir.path(), creds()).unwrap();
            store.save_account(&AccountPickle::new("pickle")).unwrap();
        }
        std::fs::write(dir.path().join(ACCOUNT_FILE), b"{corrupt").unwrap();

        let store = FileCryptoStore::open(dir.path(), creds()).unwrap();
        assert!(store.load_account().unwrap().is_none());
    }
}
