// shared-types-rs/src/model.rs
//
// Domain model shared across the custody core. Serialized shapes here are
// wire/persistence contracts; field order on hashed structures is load-bearing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{format_timestamp, sha256_hex, Severity};

/// Record payload classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileType {
    Pdf,
    Dicom,
    Image,
    Other,
}

/// Record lifecycle status. `Archived` is terminal and rejects writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordStatus {
    Draft,
    Active,
    Archived,
}

impl RecordStatus {
    pub fn accepts_writes(&self) -> bool {
        !matches!(self, RecordStatus::Archived)
    }

    /// Valid lifecycle transitions: DRAFT -> ACTIVE -> ARCHIVED.
    /// ACTIVE -> ACTIVE is a new version, not a transition.
    pub fn can_transition_to(&self, next: RecordStatus) -> bool {
        matches!(
            (self, next),
            (RecordStatus::Draft, RecordStatus::Active)
                | (RecordStatus::Active, RecordStatus::Archived)
        )
    }
}

/// A custody record header. The ciphertext itself lives in the object store;
/// the authoritative commitment lives on the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub record_id: Uuid,
    pub patient_id: String,
    pub creator_id: String,
    pub title: String,
    pub description: String,
    pub file_type: FileType,
    /// SHA-256 of the plaintext, lowercase hex.
    pub content_hash: String,
    /// CID of the object-store metadata object.
    pub primary_cid: String,
    /// Data key that encrypts this record's chunks.
    pub data_key_id: String,
    pub version_number: u64,
    /// Merkle root over the ordered version-entry hashes.
    pub merkle_root: String,
    pub status: RecordStatus,
    pub ledger_tx_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One entry of a record's append-only version chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub version: u64,
    pub cid: String,
    /// SHA-256 over the canonical serialization of this entry.
    pub hash: String,
    pub creator_id: String,
    pub timestamp: DateTime<Utc>,
    /// Previous entry's hash, empty string for version 1.
    pub previous_hash: String,
}

/// Hashed shape of a version entry. Field order here defines the canonical
/// key order; do not reorder.
#[derive(Serialize)]
struct CanonicalVersion<'a> {
    version: u64,
    cid: &'a str,
    timestamp: String,
    creator_id: &'a str,
    previous_hash: &'a str,
}

impl VersionEntry {
    /// Byte-identical canonical serialization used for chain hashing.
    pub fn canonical_json(&self) -> String {
        let canon = CanonicalVersion {
            version: self.version,
            cid: &self.cid,
            timestamp: format_timestamp(&self.timestamp),
            creator_id: &self.creator_id,
            previous_hash: &self.previous_hash,
        };
        // Struct serialization preserves declaration order and is compact.
        serde_json::to_string(&canon).expect("canonical version serialization cannot fail")
    }

    /// Recompute the entry hash from the canonical serialization.
    pub fn compute_hash(&self) -> String {
        sha256_hex(self.canonical_json().as_bytes())
    }

    /// Build a new entry with its hash sealed in.
    pub fn seal(
        version: u64,
        cid: impl Into<String>,
        creator_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        previous_hash: impl Into<String>,
    ) -> Self {
        let mut entry = Self {
            version,
            cid: cid.into(),
            hash: String::new(),
            creator_id: creator_id.into(),
            timestamp,
            previous_hash: previous_hash.into(),
        };
        entry.hash = entry.compute_hash();
        entry
    }
}

/// Replication pin state of an object-store entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PinState {
    Pinned,
    Unpinned,
}

/// Metadata object persisted next to the ciphertext chunks. This is the
/// UTF-8 JSON shape written to the object store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub file_name: String,
    /// SHA-256 of the plaintext, lowercase hex.
    pub content_hash: String,
    pub file_size: u64,
    pub mime_type: String,
    pub chunk_count: usize,
    /// Ordered by chunk index.
    pub chunk_cids: Vec<String>,
    /// 12-byte AES-GCM IV, hex.
    pub iv: String,
    /// 16-byte GCM tag, hex.
    pub auth_tag: String,
    pub encryption_algorithm: String,
    /// Key id issued by custody when the caller supplied no key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_key_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub pin_state: PinState,
    pub replication_count: u32,
}

/// Symmetric vs asymmetric custody key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeyType {
    Symmetric,
    Asymmetric,
}

/// Public metadata of a custody key. Key material never appears here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataKeyMetadata {
    pub key_id: String,
    pub owner: String,
    pub purpose: String,
    pub algorithm: String,
    pub key_type: KeyType,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl DataKeyMetadata {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|e| e <= now).unwrap_or(false)
    }

    /// Inactive or expired keys never produce plaintext to callers.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_expired(now)
    }
}

/// Grantable actions on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PermissionAction {
    Read,
    Write,
    Admin,
}

impl PermissionAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "READ" => Some(Self::Read),
            "WRITE" => Some(Self::Write),
            "ADMIN" => Some(Self::Admin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::Admin => "ADMIN",
        }
    }
}

/// Denormalized view of an on-ledger grant, maintained by the event consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permission {
    pub record_id: Uuid,
    pub grantee_id: String,
    pub action: PermissionAction,
    pub granted_by: String,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl Permission {
    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.map(|e| e > now).unwrap_or(true)
    }
}

/// Append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub log_id: Uuid,
    pub user_id: String,
    pub action: String,
    pub resource: String,
    pub timestamp: DateTime<Utc>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub detail: Value,
    pub ledger_tx_id: Option<String>,
    pub severity: Severity,
}

impl AuditEntry {
    pub fn new(
        user_id: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
        severity: Severity,
        detail: Value,
    ) -> Self {
        Self {
            log_id: Uuid::new_v4(),
            user_id: user_id.into(),
            action: action.into(),
            resource: resource.into(),
            timestamp: Utc::now(),
            ip: None,
            user_agent: None,
            detail,
            ledger_tx_id: None,
            severity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 20, 8, 0, 0).unwrap() + chrono::Duration::milliseconds(250)
    }

    #[test]
    fn canonical_version_key_order_is_fixed() {
        let entry = VersionEntry::seal(1, "QmAbc", "d1", ts(), "");
        let json = entry.canonical_json();
        assert_eq!(
            json,
            r#"{"version":1,"cid":"QmAbc","timestamp":"2024-05-20T08:00:00.250Z","creator_id":"d1","previous_hash":""}"#
        );
    }

    #[test]
    fn sealed_entry_hash_matches_recompute() {
        let entry = VersionEntry::seal(2, "QmDef", "d1", ts(), "aabbcc");
        assert_eq!(entry.hash, entry.compute_hash());
        assert_eq!(entry.hash.len(), 64);
    }

    #[test]
    fn archived_rejects_writes() {
        assert!(RecordStatus::Active.accepts_writes());
        assert!(!RecordStatus::Archived.accepts_writes());
        assert!(RecordStatus::Draft.can_transition_to(RecordStatus::Active));
        assert!(!RecordStatus::Archived.can_transition_to(RecordStatus::Active));
    }

    #[test]
    fn permission_effectiveness_window() {
        let mut perm = Permission {
            record_id: Uuid::new_v4(),
            grantee_id: "d2".into(),
            action: PermissionAction::Read,
            granted_by: "d1".into(),
            granted_at: ts(),
            expires_at: Some(ts() + chrono::Duration::hours(1)),
            is_active: true,
        };
        assert!(perm.is_effective(ts()));
        assert!(!perm.is_effective(ts() + chrono::Duration::hours(2)));
        perm.is_active = false;
        assert!(!perm.is_effective(ts()));
    }

    #[test]
    fn object_metadata_json_roundtrip() {
        let metadata = ObjectMetadata {
            file_name: "scan.dcm".into(),
            content_hash: "ab".repeat(32),
            file_size: 524289,
            mime_type: "application/dicom".into(),
            chunk_count: 3,
            chunk_cids: vec!["Qm1".into(), "Qm2".into(), "Qm3".into()],
            iv: "00".repeat(12),
            auth_tag: "11".repeat(16),
            encryption_algorithm: "AES-256-GCM".into(),
            data_key_id: Some("key-1".into()),
            created_at: ts(),
            pin_state: PinState::Pinned,
            replication_count: 3,
        };
        let encoded = serde_json::to_string(&metadata).unwrap();
        let decoded: ObjectMetadata = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, metadata);
    }

    #[test]
    fn file_type_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&FileType::Dicom).unwrap(), r#""DICOM""#);
        assert_eq!(serde_json::to_string(&PinState::Pinned).unwrap(), r#""PINNED""#);
    }
}
