//! Persistent storage for Olm/Megolm crypto-session state.
//!
//! This crate is the durable half of an end-to-end encrypted messaging
//! client: it records the device's pickled account, per-device Olm
//! sessions, Megolm inbound group sessions, room encryption settings,
//! device metadata, and room-key request bookkeeping, so encrypted
//! conversations survive restarts.
//!
//! # Main API
//!
//! - [`CryptoStore`] - Trait the rest of the client depends on
//! - [`SqliteCryptoStore`] - Structured SQLite backend (preferred)
//! - [`FileCryptoStore`] - Legacy flat-file backend
//!
//! # Migration
//!
//! Opening a [`SqliteCryptoStore`] in a directory that still holds
//! legacy file-store data migrates every record into SQLite before the
//! handle is returned, verifies the copy, and then deletes the legacy
//! files. On failure the legacy data is left in place and the open
//! fails, so the next open retries.
//!
//! # Security
//!
//! Pickled session and account state is treated as opaque key material:
//! it is never written to logs or error messages, and in-memory account
//! pickles are zeroized on drop. Encryption of the pickles themselves is
//! owned by the crypto layer that produces them.
//!
//! # Example
//!
//! ```no_run
//! use crypto_store::{AccountPickle, Credentials, CryptoStore, SqliteCryptoStore};
//!
//! let credentials = Credentials::new("@alice:example.org", "ALICEDEVICE");
//! let store = SqliteCryptoStore::open("crypto", credentials).unwrap();
//!
//! store.save_account(&AccountPickle::new("pickled-account")).unwrap();
//! assert!(store.load_account().unwrap().is_some());
//! ```

pub mod codec;
pub mod error;
pub mod file;
pub mod migration;
pub mod sqlite;
pub mod store;
pub mod types;

// Re-exports for convenience
pub use error::StoreError;
pub use file::FileCryptoStore;
pub use sqlite::SqliteCryptoStore;
pub use store::CryptoStore;
pub use types::{
    AccountPickle, Credentials, DeviceInfo, DeviceTrackingStatuses, DeviceVerification,
    InboundGroupSessionRecord, IncomingKeyRequest, KeyRequestBody, KeyRequestState,
    OutgoingKeyRequest, RequestRecipient, SessionRecord,
};
