// shared-types-rs/src/lib.rs
//
// Cross-crate types for the medical-record custody core:
// - Domain model (records, version entries, object metadata, permissions)
// - The caller-visible error taxonomy with transient classification
// - Environment configuration helpers shared by every component

pub mod config;
pub mod error;
pub mod model;

pub use error::{CustodyError, ErrorKind, Result, Severity};
pub use model::{
    AuditEntry, DataKeyMetadata, FileType, KeyType, ObjectMetadata, Permission, PermissionAction,
    PinState, Record, RecordStatus, VersionEntry,
};

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 digest of raw bytes.
///
/// Every content hash in the system (plaintext hashes, version-entry hashes,
/// Merkle nodes) is this exact encoding so digests compare as plain strings.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Canonical timestamp rendering: RFC 3339 UTC with millisecond precision.
///
/// Writers MUST use this for anything that gets hashed or sent to the ledger
/// so serialization is byte-identical across processes.
pub fn format_timestamp(ts: &chrono::DateTime<chrono::Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
