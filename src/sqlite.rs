//! Structured SQLite store.
//!
//! One table per entity with the entity's natural primary key, WAL
//! journaling, and explicit transactions for every logical operation
//! that touches more than one row. The connection mutex plus the
//! transaction boundary is the sole serialization point; readers always
//! observe a committed snapshot.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, warn};

use crate::codec;
use crate::error::StoreError;
use crate::migration;
use crate::store::CryptoStore;
use crate::types::{
    AccountPickle, Credentials, DeviceInfo, DeviceTrackingStatuses, InboundGroupSessionRecord,
    IncomingKeyRequest, KeyRequestBody, OutgoingKeyRequest, SessionRecord,
};

/// File name of the database inside the store directory.
pub(crate) const DB_FILE: &str = "crypto_store.db";

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS metadata (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        user_id TEXT NOT NULL,
        device_id TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS account (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        pickle TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS olm_sessions (
        device_key TEXT NOT NULL,
        session_id TEXT NOT NULL,
        pickle TEXT NOT NULL,
        PRIMARY KEY (device_key, session_id)
    );

    CREATE TABLE IF NOT EXISTS inbound_group_sessions (
        sender_key TEXT NOT NULL,
        session_id TEXT NOT NULL,
        message_index INTEGER NOT NULL,
        pickle TEXT NOT NULL,
        PRIMARY KEY (sender_key, session_id)
    );

    CREATE TABLE IF NOT EXISTS room_settings (
        room_id TEXT PRIMARY KEY,
        algorithm TEXT,
        blacklist_unverified INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS user_devices (
        user_id TEXT NOT NULL,
        device_id TEXT NOT NULL,
        info TEXT NOT NULL,
        PRIMARY KEY (user_id, device_id)
    );

    CREATE TABLE IF NOT EXISTS device_tracking (
        user_id TEXT PRIMARY KEY,
        status INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS outgoing_key_requests (
        body_key TEXT PRIMARY KEY,
        request_id TEXT NOT NULL,
        record TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS incoming_key_requests (
        user_id TEXT NOT NULL,
        device_id TEXT NOT NULL,
        request_id TEXT NOT NULL,
        record TEXT NOT NULL,
        PRIMARY KEY (user_id, device_id, request_id)
    );
"#;

const ENTITY_TABLES: [&str; 8] = [
    "account",
    "olm_sessions",
    "inbound_group_sessions",
    "room_settings",
    "user_devices",
    "device_tracking",
    "outgoing_key_requests",
    "incoming_key_requests",
];

/// Per-entity-kind record counts, used by the migration coordinator to
/// verify a copy before the legacy store is retired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct EntityCounts {
    pub accounts: u64,
    pub olm_sessions: u64,
    pub inbound_group_sessions: u64,
    pub room_settings: u64,
    pub user_devices: u64,
    pub tracking_statuses: u64,
    pub outgoing_requests: u64,
    pub incoming_requests: u64,
}

impl EntityCounts {
    pub fn total(&self) -> u64 {
        self.accounts
            + self.olm_sessions
            + self.inbound_group_sessions
            + self.room_settings
            + self.user_devices
            + self.tracking_statuses
            + self.outgoing_requests
            + self.incoming_requests
    }

    /// Whether every kind in `self` holds at least as many records as
    /// `expected`.
    pub fn covers(&self, expected: &EntityCounts) -> bool {
        self.accounts >= expected.accounts
            && self.olm_sessions >= expected.olm_sessions
            && self.inbound_group_sessions >= expected.inbound_group_sessions
            && self.room_settings >= expected.room_settings
            && self.user_devices >= expected.user_devices
            && self.tracking_statuses >= expected.tracking_statuses
            && self.outgoing_requests >= expected.outgoing_requests
            && self.incoming_requests >= expected.incoming_requests
    }
}

/// Single-row and keyed upserts shared between the trait methods
/// (which run them on the locked connection) and the migration
/// coordinator (which runs them inside per-entity-kind transactions;
/// `Transaction` derefs to `Connection`).
pub(crate) mod ops {
    use rusqlite::{params, Connection};

    use crate::types::{InboundGroupSessionRecord, SessionRecord};

    pub fn save_account(conn: &Connection, pickle: &str) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO account (id, pickle) VALUES (1, ?1)",
            params![pickle],
        )?;
        Ok(())
    }

    pub fn save_session(
        conn: &Connection,
        device_key: &str,
        session: &SessionRecord,
    ) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO olm_sessions (device_key, session_id, pickle)
             VALUES (?1, ?2, ?3)",
            params![device_key, session.session_id, session.pickle],
        )?;
        Ok(())
    }

    /// Upsert guarded so an older ratchet index never replaces a newer
    /// one.
    pub fn save_inbound_group_session(
        conn: &Connection,
        session: &InboundGroupSessionRecord,
    ) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO inbound_group_sessions (sender_key, session_id, message_index, pickle)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(sender_key, session_id) DO UPDATE SET
                 message_index = excluded.message_index,
                 pickle = excluded.pickle
             WHERE excluded.message_index >= inbound_group_sessions.message_index",
            params![
                session.sender_key,
                session.session_id,
                session.message_index,
                session.pickle,
            ],
        )?;
        Ok(())
    }

    pub fn save_room_settings(
        conn: &Connection,
        room_id: &str,
        algorithm: Option<&str>,
        blacklist_unverified: bool,
    ) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO room_settings (room_id, algorithm, blacklist_unverified)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(room_id) DO UPDATE SET
                 algorithm = excluded.algorithm,
                 blacklist_unverified = excluded.blacklist_unverified",
            params![room_id, algorithm, blacklist_unverified],
        )?;
        Ok(())
    }

    pub fn save_user_device(
        conn: &Connection,
        user_id: &str,
        device_id: &str,
        info: &str,
    ) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO user_devices (user_id, device_id, info) VALUES (?1, ?2, ?3)",
            params![user_id, device_id, info],
        )?;
        Ok(())
    }

    pub fn save_tracking_status(
        conn: &Connection,
        user_id: &str,
        status: i32,
    ) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO device_tracking (user_id, status) VALUES (?1, ?2)",
            params![user_id, status],
        )?;
        Ok(())
    }

    pub fn save_outgoing_request(
        conn: &Connection,
        body_key: &str,
        request_id: &str,
        record: &str,
    ) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO outgoing_key_requests (body_key, request_id, record)
             VALUES (?1, ?2, ?3)",
            params![body_key, request_id, record],
        )?;
        Ok(())
    }

    pub fn save_incoming_request(
        conn: &Connection,
        user_id: &str,
        device_id: &str,
        request_id: &str,
        record: &str,
    ) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO incoming_key_requests (user_id, device_id, request_id, record)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id, device_id, request_id, record],
        )?;
        Ok(())
    }
}

/// SQLite-backed crypto store.
pub struct SqliteCryptoStore {
    conn: Mutex<Connection>,
    credentials: Credentials,
}

impl SqliteCryptoStore {
    /// Open (or create) the structured store in `dir` for `credentials`.
    ///
    /// If the directory holds data recorded under different credentials,
    /// the stale data is wiped first. If a legacy file store for the
    /// same directory has data, it is migrated into this store before
    /// the handle is returned and then irreversibly deleted; on
    /// migration failure the legacy data is left untouched and the open
    /// fails, so the next open retries.
    pub fn open(dir: impl AsRef<Path>, credentials: Credentials) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join(DB_FILE))?;
        let store = Self::initialize(conn, credentials)?;
        migration::migrate_legacy_store(dir, &store)?;
        Ok(store)
    }

    /// Create an in-memory store (for testing). No migration runs.
    pub fn open_in_memory(credentials: Credentials) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn, credentials)
    }

    /// Consume and close the store. Data stays on disk.
    pub fn close(self) {}

    fn initialize(conn: Connection, credentials: Credentials) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;

        let store = Self {
            conn: Mutex::new(conn),
            credentials,
        };

        let recorded: Option<Credentials> = {
            let conn = store.conn.lock().unwrap();
            conn.query_row(
                "SELECT user_id, device_id FROM metadata WHERE id = 1",
                [],
                |row| {
                    Ok(Credentials {
                        user_id: row.get(0)?,
                        device_id: row.get(1)?,
                    })
                },
            )
            .optional()?
        };

        match recorded {
            Some(ref c) if *c != store.credentials => {
                warn!("sqlite store credentials changed, wiping stale data");
                store.wipe()?;
            }
            _ => {}
        }

        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT OR REPLACE INTO metadata (id, user_id, device_id) VALUES (1, ?1, ?2)",
                params![store.credentials.user_id, store.credentials.device_id],
            )?;
        }

        debug!("opened sqlite crypto store");
        Ok(store)
    }

    pub(crate) fn entity_counts(&self) -> Result<EntityCounts, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut counts = [0u64; 8];
        for (i, table) in ENTITY_TABLES.iter().enumerate() {
            counts[i] = conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", table),
                [],
                |row| row.get::<_, i64>(0),
            )? as u64;
        }
        Ok(EntityCounts {
            accounts: counts[0],
            olm_sessions: counts[1],
            inbound_group_sessions: counts[2],
            room_settings: counts[3],
            user_devices: counts[4],
            tracking_statuses: counts[5],
            outgoing_requests: counts[6],
            incoming_requests: counts[7],
        })
    }

    /// Run `f` inside one immediate transaction.
    pub(crate) fn with_transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}

impl CryptoStore for SqliteCryptoStore {
    fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    fn has_data(&self) -> Result<bool, StoreError> {
        Ok(self.entity_counts()?.total() > 0)
    }

    fn wipe(&self) -> Result<(), StoreError> {
        self.with_transaction(|tx| {
            for table in ENTITY_TABLES {
                tx.execute(&format!("DELETE FROM {}", table), [])?;
            }
            tx.execute("DELETE FROM metadata", [])?;
            Ok(())
        })?;
        debug!("wiped sqlite crypto store");
        Ok(())
    }

    fn save_account(&self, account: &AccountPickle) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        ops::save_account(&conn, &account.pickle)?;
        Ok(())
    }

    fn load_account(&self) -> Result<Option<AccountPickle>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let pickle = conn
            .query_row("SELECT pickle FROM account WHERE id = 1", [], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(pickle.map(AccountPickle::new))
    }

    fn save_session(&self, device_key: &str, session: &SessionRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        ops::save_session(&conn, device_key, session)?;
        Ok(())
    }

    fn load_session(
        &self,
        device_key: &str,
        session_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let pickle = conn
            .query_row(
                "SELECT pickle FROM olm_sessions WHERE device_key = ?1 AND session_id = ?2",
                params![device_key, session_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(pickle.map(|pickle| SessionRecord {
            session_id: session_id.to_string(),
            pickle,
        }))
    }

    fn session_ids(&self, device_key: &str) -> Result<BTreeSet<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT session_id FROM olm_sessions WHERE device_key = ?1")?;
        let ids = stmt
            .query_map(params![device_key], |row| row.get::<_, String>(0))?
            .collect::<Result<_, _>>()?;
        Ok(ids)
    }

    fn save_inbound_group_session(
        &self,
        session: &InboundGroupSessionRecord,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        ops::save_inbound_group_session(&conn, session)?;
        Ok(())
    }

    fn load_inbound_group_session(
        &self,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<InboundGroupSessionRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT message_index, pickle FROM inbound_group_sessions
                 WHERE sender_key = ?1 AND session_id = ?2",
                params![sender_key, session_id],
                |row| Ok((row.get::<_, u32>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(message_index, pickle)| InboundGroupSessionRecord {
            sender_key: sender_key.to_string(),
            session_id: session_id.to_string(),
            message_index,
            pickle,
        }))
    }

    fn inbound_group_sessions(&self) -> Result<Vec<InboundGroupSessionRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT sender_key, session_id, message_index, pickle FROM inbound_group_sessions",
        )?;
        let sessions = stmt
            .query_map([], |row| {
                Ok(InboundGroupSessionRecord {
                    sender_key: row.get(0)?,
                    session_id: row.get(1)?,
                    message_index: row.get(2)?,
                    pickle: row.get(3)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(sessions)
    }

    fn save_room_algorithm(&self, room_id: &str, algorithm: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO room_settings (room_id, algorithm) VALUES (?1, ?2)
             ON CONFLICT(room_id) DO UPDATE SET algorithm = excluded.algorithm",
            params![room_id, algorithm],
        )?;
        Ok(())
    }

    fn room_algorithm(&self, room_id: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let algorithm = conn
            .query_row(
                "SELECT algorithm FROM room_settings WHERE room_id = ?1",
                params![room_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(algorithm.flatten())
    }

    fn set_blacklist_unverified_rooms(&self, room_ids: &[String]) -> Result<(), StoreError> {
        self.with_transaction(|tx| {
            tx.execute("UPDATE room_settings SET blacklist_unverified = 0", [])?;
            for room_id in room_ids {
                tx.execute(
                    "INSERT INTO room_settings (room_id, blacklist_unverified) VALUES (?1, 1)
                     ON CONFLICT(room_id) DO UPDATE SET blacklist_unverified = 1",
                    params![room_id],
                )?;
            }
            Ok(())
        })
    }

    fn blacklist_unverified_rooms(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT room_id FROM room_settings WHERE blacklist_unverified = 1 ORDER BY room_id",
        )?;
        let rooms = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<_, _>>()?;
        Ok(rooms)
    }

    fn save_user_device(&self, user_id: &str, device: &DeviceInfo) -> Result<(), StoreError> {
        let info = codec::encode(device)?;
        let conn = self.conn.lock().unwrap();
        ops::save_user_device(&conn, user_id, &device.device_id, &info)?;
        Ok(())
    }

    fn load_user_device(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<DeviceInfo>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let info = conn
            .query_row(
                "SELECT info FROM user_devices WHERE user_id = ?1 AND device_id = ?2",
                params![user_id, device_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        // Corrupt records read as absent.
        Ok(codec::decode(info.as_deref()))
    }

    fn user_devices(
        &self,
        user_id: &str,
    ) -> Result<BTreeMap<String, DeviceInfo>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT device_id, info FROM user_devices WHERE user_id = ?1")?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut devices = BTreeMap::new();
        for row in rows {
            let (device_id, info) = row?;
            if let Some(device) = codec::decode::<DeviceInfo>(Some(&info)) {
                devices.insert(device_id, device);
            }
        }
        Ok(devices)
    }

    fn save_device_tracking_statuses(
        &self,
        statuses: &DeviceTrackingStatuses,
    ) -> Result<(), StoreError> {
        self.with_transaction(|tx| {
            tx.execute("DELETE FROM device_tracking", [])?;
            for (user_id, status) in statuses {
                ops::save_tracking_status(tx, user_id, *status)?;
            }
            Ok(())
        })
    }

    fn device_tracking_statuses(&self) -> Result<DeviceTrackingStatuses, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT user_id, status FROM device_tracking")?;
        let statuses = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i32>(1)?))
            })?
            .collect::<Result<_, _>>()?;
        Ok(statuses)
    }

    fn get_or_add_outgoing_key_request(
        &self,
        request: OutgoingKeyRequest,
    ) -> Result<OutgoingKeyRequest, StoreError> {
        let body_key = codec::body_key(&request.body);
        let record = codec::encode(&request)?;
        // Select-then-insert inside one transaction; racing callers on
        // the same body all land on the single stored record.
        self.with_transaction(|tx| {
            let existing = tx
                .query_row(
                    "SELECT record FROM outgoing_key_requests WHERE body_key = ?1",
                    params![body_key],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            if let Some(existing) = existing {
                if let Some(existing) = codec::decode::<OutgoingKeyRequest>(Some(&existing)) {
                    return Ok(existing);
                }
            }
            ops::save_outgoing_request(tx, &body_key, &request.request_id, &record)?;
            Ok(request)
        })
    }

    fn outgoing_key_request(
        &self,
        body: &KeyRequestBody,
    ) -> Result<Option<OutgoingKeyRequest>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT record FROM outgoing_key_requests WHERE body_key = ?1",
                params![codec::body_key(body)],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(codec::decode(record.as_deref()))
    }

    fn save_incoming_key_request(&self, request: &IncomingKeyRequest) -> Result<(), StoreError> {
        let record = codec::encode(request)?;
        let conn = self.conn.lock().unwrap();
        ops::save_incoming_request(
            &conn,
            &request.user_id,
            &request.device_id,
            &request.request_id,
            &record,
        )?;
        Ok(())
    }

    fn incoming_key_request(
        &self,
        user_id: &str,
        device_id: &str,
        request_id: &str,
    ) -> Result<Option<IncomingKeyRequest>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT record FROM incoming_key_requests
                 WHERE user_id = ?1 AND device_id = ?2 AND request_id = ?3",
                params![user_id, device_id, request_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(codec::decode(record.as_deref()))
    }

    fn pending_incoming_key_requests(&self) -> Result<Vec<IncomingKeyRequest>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT record FROM incoming_key_requests")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut requests = Vec::new();
        for row in rows {
            let record = row?;
            if let Some(request) = codec::decode::<IncomingKeyRequest>(Some(&record)) {
                requests.push(request);
            }
        }
        Ok(requests)
    }

    fn delete_incoming_key_request(
        &self,
        user_id: &str,
        device_id: &str,
        request_id: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM incoming_key_requests
             WHERE user_id = ?1 AND device_id = ?2 AND request_id = ?3",
            params![user_id, device_id, request_id],
        )?;
        Ok(())
    }
}
