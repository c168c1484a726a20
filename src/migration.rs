//! One-time migration from the legacy file store into the SQLite store.
//!
//! Runs synchronously while the SQLite store is being opened, before the
//! handle is handed to the caller, so it never interleaves with
//! application traffic. The legacy files are deleted only after every
//! entity kind has been committed and the per-kind record counts have
//! been re-checked against the copy; any failure before that point
//! leaves the legacy store untouched so the next open can retry.

use std::path::Path;

use tracing::{debug, info};

use crate::codec;
use crate::error::StoreError;
use crate::file::{FileCryptoStore, FileStoreContents};
use crate::sqlite::{ops, EntityCounts, SqliteCryptoStore};
use crate::store::CryptoStore;

/// Detect legacy data in `dir` and, if present, copy it into `store`
/// and retire the legacy files.
///
/// Returns `true` if a migration ran.
pub(crate) fn migrate_legacy_store(
    dir: &Path,
    store: &SqliteCryptoStore,
) -> Result<bool, StoreError> {
    if !FileCryptoStore::exists(dir) {
        return Ok(false);
    }

    // Opening with the store's credentials also clears legacy data that
    // belongs to a different credential set; in that case there is
    // nothing left to migrate.
    let legacy = FileCryptoStore::open(dir, store.credentials().clone())?;
    if !legacy.has_data()? {
        return Ok(false);
    }

    info!("legacy crypto store found, migrating");
    let snapshot = legacy.snapshot();
    let expected = count_snapshot(&snapshot);

    copy_snapshot(&snapshot, store)?;

    // Verify before retiring: every copied kind must be accounted for
    // in the structured store.
    let copied = store.entity_counts()?;
    if !copied.covers(&expected) {
        return Err(StoreError::Migration(format!(
            "record counts after copy do not cover the legacy store \
             (expected {:?}, found {:?})",
            expected, copied
        )));
    }

    // Retire only after the copy is durably committed. This is the
    // irreversible step.
    legacy.wipe()?;
    legacy.close();
    info!(records = expected.total(), "legacy crypto store migrated and retired");
    Ok(true)
}

/// Copy every entity kind, one transaction per kind.
///
/// A failure mid-kind rolls that kind's transaction back and aborts the
/// whole migration.
fn copy_snapshot(
    snapshot: &FileStoreContents,
    store: &SqliteCryptoStore,
) -> Result<(), StoreError> {
    store.with_transaction(|tx| {
        if let Some(ref account) = snapshot.account {
            ops::save_account(tx, &account.pickle)?;
        }
        Ok(())
    })?;

    store.with_transaction(|tx| {
        for (device_key, by_id) in &snapshot.sessions {
            for session in by_id.values() {
                ops::save_session(tx, device_key, session)?;
            }
        }
        Ok(())
    })?;

    store.with_transaction(|tx| {
        for by_id in snapshot.inbound_group_sessions.values() {
            for session in by_id.values() {
                ops::save_inbound_group_session(tx, session)?;
            }
        }
        Ok(())
    })?;

    store.with_transaction(|tx| {
        for (room_id, settings) in &snapshot.rooms {
            ops::save_room_settings(
                tx,
                room_id,
                settings.algorithm.as_deref(),
                settings.blacklist_unverified_devices,
            )?;
        }
        Ok(())
    })?;

    store.with_transaction(|tx| {
        for (user_id, by_id) in &snapshot.devices {
            for device in by_id.values() {
                let info = codec::encode(device)?;
                ops::save_user_device(tx, user_id, &device.device_id, &info)?;
            }
        }
        for (user_id, status) in &snapshot.tracking_statuses {
            ops::save_tracking_status(tx, user_id, *status)?;
        }
        Ok(())
    })?;

    store.with_transaction(|tx| {
        for request in snapshot.outgoing_requests.values() {
            let record = codec::encode(request)?;
            ops::save_outgoing_request(
                tx,
                &codec::body_key(&request.body),
                &request.request_id,
                &record,
            )?;
        }
        Ok(())
    })?;

    store.with_transaction(|tx| {
        for request in snapshot.incoming_requests.values() {
            let record = codec::encode(request)?;
            ops::save_incoming_request(
                tx,
                &request.user_id,
                &request.device_id,
                &request.request_id,
                &record,
            )?;
        }
        Ok(())
    })?;

    debug!("legacy store copy committed");
    Ok(())
}

fn count_snapshot(snapshot: &FileStoreContents) -> EntityCounts {
    EntityCounts {
        accounts: snapshot.account.is_some() as u64,
        olm_sessions: snapshot.sessions.values().map(|m| m.len() as u64).sum(),
        inbound_group_sessions: snapshot
            .inbound_group_sessions
            .values()
            .map(|m| m.len() as u64)
            .sum(),
        room_settings: snapshot.rooms.len() as u64,
        user_devices: snapshot.devices.values().map(|m| m.len() as u64).sum(),
        tracking_statuses: snapshot.tracking_statuses.len() as u64,
        outgoing_requests: snapshot.outgoing_requests.len() as u64,
        incoming_requests: snapshot.incoming_requests.len() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        AccountPickle, Credentials, DeviceInfo, DeviceTrackingStatuses, DeviceVerification,
        InboundGroupSessionRecord, IncomingKeyRequest, KeyRequestBody, KeyRequestState,
        OutgoingKeyRequest, SessionRecord,
    };

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

    /// Populate a legacy store with one record of every entity kind.
    fn populate_legacy(dir: &Path) {
        let legacy = FileCryptoStore::open(dir, creds()).unwrap();

        legacy
            .save_account(&AccountPickle::new("pickled-account"))
            .unwrap();
        legacy
            .save_session(
                "device_key_1",
                &SessionRecord {
                    session_id: "olm1".into(),
                    pickle: "olm-pickle".into(),
                },
            )
            .unwrap();
        legacy
            .save_inbound_group_session(&InboundGroupSessionRecord {
                sender_key: "sender".into(),
                session_id: "megolm1".into(),
                message_index: 4,
                pickle: "megolm-pickle".into(),
            })
            .unwrap();
        legacy.save_room_algorithm("!r1", "algo1").unwrap();
        legacy.save_room_algorithm("!r2", "algo2").unwrap();
        legacy
            .set_blacklist_unverified_rooms(&["!r2".to_string()])
            .unwrap();
        legacy
            .save_user_device(
                "@bob:example.org",
                &DeviceInfo {
                    device_id: "BOBDEVICE".into(),
                    keys: [("ed25519:BOBDEVICE".to_string(), "key".to_string())]
                        .into_iter()
                        .collect(),
                    algorithms: vec!["m.megolm.v1.aes-sha2".into()],
                    verification: DeviceVerification::Verified,
                },
            )
            .unwrap();
        let statuses: DeviceTrackingStatuses =
            [("@bob:example.org".to_string(), 1)].into_iter().collect();
        legacy.save_device_tracking_statuses(&statuses).unwrap();
        legacy
            .get_or_add_outgoing_key_request(OutgoingKeyRequest {
                request_id: "req1".into(),
                recipients: vec![],
                body: body("megolm1"),
                state: KeyRequestState::Sent,
                cancellation_txn_id: None,
            })
            .unwrap();
        // A second body reusing the same request id; both records must
        // survive the copy.
        legacy
            .get_or_add_outgoing_key_request(OutgoingKeyRequest {
                request_id: "req1".into(),
                recipients: vec![],
                body: body("megolm2"),
                state: KeyRequestState::Unsent,
                cancellation_txn_id: None,
            })
            .unwrap();
        legacy
            .save_incoming_key_request(&IncomingKeyRequest {
                user_id: "@bob:example.org".into(),
                device_id: "BOBDEVICE".into(),
                request_id: "in1".into(),
                body: body("megolm1"),
            })
            .unwrap();
    }

    #[test]
    fn no_legacy_data_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCryptoStore::open(dir.path(), creds()).unwrap();
        assert!(!store.has_data().unwrap());
        assert!(!FileCryptoStore::exists(dir.path()));
    }

    #[test]
    fn migrates_every_entity_kind_and_retires_legacy() {
        let dir = tempfile::tempdir().unwrap();
        populate_legacy(dir.path());
        assert!(FileCryptoStore::exists(dir.path()));

        let store = SqliteCryptoStore::open(dir.path(), creds()).unwrap();

        assert_eq!(
            store.load_account().unwrap().unwrap().pickle,
            "pickled-account"
        );
        assert_eq!(
            store
                .load_session("device_key_1", "olm1")
                .unwrap()
                .unwrap()
                .pickle,
            "olm-pickle"
        );
        let megolm = store
            .load_inbound_group_session("sender", "megolm1")
            .unwrap()
            .unwrap();
        assert_eq!(megolm.message_index, 4);
        assert_eq!(megolm.pickle, "megolm-pickle");
        assert_eq!(store.room_algorithm("!r1").unwrap().unwrap(), "algo1");
        assert_eq!(store.room_algorithm("!r2").unwrap().unwrap(), "algo2");
        assert_eq!(store.blacklist_unverified_rooms().unwrap(), vec!["!r2"]);
        let device = store
            .load_user_device("@bob:example.org", "BOBDEVICE")
            .unwrap()
            .unwrap();
        assert_eq!(device.verification, DeviceVerification::Verified);
        assert_eq!(
            store
                .device_tracking_statuses()
                .unwrap()
                .get("@bob:example.org"),
            Some(&1)
        );
        let outgoing = store
            .outgoing_key_request(&body("megolm1"))
            .unwrap()
            .unwrap();
        assert_eq!(outgoing.request_id, "req1");
        assert_eq!(outgoing.state, KeyRequestState::Sent);
        assert_eq!(
            store
                .outgoing_key_request(&body("megolm2"))
                .unwrap()
                .unwrap()
                .state,
            KeyRequestState::Unsent
        );
        assert!(store
            .incoming_key_request("@bob:example.org", "BOBDEVICE", "in1")
            .unwrap()
            .is_some());

        // The legacy store is retired irreversibly.
        assert!(!FileCryptoStore::exists(dir.path()));
        let legacy = FileCryptoStore::open(dir.path(), creds()).unwrap();
        assert!(!legacy.has_data().unwrap());
    }

    #[test]
    fn migration_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        populate_legacy(dir.path());

        {
            let store = SqliteCryptoStore::open(dir.path(), creds()).unwrap();
            // Post-migration writes must survive the next open untouched.
            store
                .save_room_algorithm("!r1", "algo1-updated")
                .unwrap();
            store.close();
        }

        let store = SqliteCryptoStore::open(dir.path(), creds()).unwrap();
        assert_eq!(
            store.room_algorithm("!r1").unwrap().unwrap(),
            "algo1-updated"
        );
    }

    #[test]
    fn failed_copy_keeps_legacy_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        populate_legacy(dir.path());

        // Sabotage one entity table so the copy of that kind fails.
        let store = SqliteCryptoStore::open_in_memory(creds()).unwrap();
        store
            .with_transaction(|tx| {
                tx.execute("DROP TABLE incoming_key_requests", [])?;
                Ok(())
            })
            .unwrap();

        assert!(migrate_legacy_store(dir.path(), &store).is_err());

        // The legacy store is left untouched so a later open can retry.
        assert!(FileCryptoStore::exists(dir.path()));
        let legacy = FileCryptoStore::open(dir.path(), creds()).unwrap();
        assert!(legacy.has_data().unwrap());
        assert_eq!(
            legacy.load_account().unwrap().unwrap().pickle,
            "pickled-account"
        );
        assert_eq!(legacy.pending_incoming_key_requests().unwrap().len(), 1);
    }

    #[test]
    fn corrupt_database_fails_open_and_keeps_legacy() {
        let dir = tempfile::tempdir().unwrap();
        populate_legacy(dir.path());
        std::fs::write(dir.path().join(crate::sqlite::DB_FILE), b"not a database").unwrap();

        assert!(SqliteCryptoStore::open(dir.path(), creds()).is_err());
        assert!(FileCryptoStore::exists(dir.path()));
    }

    #[test]
    fn legacy_data_for_other_credentials_is_not_migrated() {
        let dir = tempfile::tempdir().unwrap();
        {
            let legacy =
                FileCryptoStore::open(dir.path(), Credentials::new("@old:example.org", "OLD"))
                    .unwrap();
            legacy.save_account(&AccountPickle::new("old-pickle")).unwrap();
        }

        let store = SqliteCryptoStore::open(dir.path(), creds()).unwrap();
        assert!(store.load_account().unwrap().is_none());
        assert!(!FileCryptoStore::exists(dir.path()));
    }
}
