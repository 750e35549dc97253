// metadata-store-rs/src/lib.rs
//
// Storage backend abstraction for the custody core's relational metadata:
// record headers, version chains, object metadata, the denormalized
// permission view, the audit log and the CID<->record mapping.
//
// Two backends: PostgreSQL for production (read/write split across replica
// pools) and in-memory for tests and LIGHT_MODE development. Bundle commits
// are atomic in both.

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared_types::config::{env_csv, env_parse, env_string};
use shared_types::{
    AuditEntry, ObjectMetadata, Permission, PermissionAction, Record, RecordStatus, VersionEntry,
};
use uuid::Uuid;

pub use memory::MemoryMetadataStore;
pub use postgres::PgMetadataStore;

/// Data-key bookkeeping row; material never lands here.
#[derive(Debug, Clone)]
pub struct DataKeyRow {
    pub key_id: String,
    pub owner: String,
    pub purpose: String,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
}

/// Typed persistence operations. All writes are idempotent upserts except
/// version inserts, which are append-only.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Create schema / prepare state.
    async fn initialize(&self) -> Result<()>;

    async fn is_healthy(&self) -> bool;

    /// Commit a record header, one new version entry and the object
    /// metadata in a single transaction. Used by both create and
    /// new-version flows; the record row is upserted.
    async fn commit_record_bundle(
        &self,
        record: &Record,
        version: &VersionEntry,
        object: &ObjectMetadata,
    ) -> Result<()>;

    async fn load_record(&self, record_id: Uuid) -> Result<Option<Record>>;

    async fn update_record_status(&self, record_id: Uuid, status: RecordStatus) -> Result<()>;

    async fn records_for_patient(&self, patient_id: &str) -> Result<Vec<Record>>;

    /// Ordered version chain for a record.
    async fn load_versions(&self, record_id: Uuid) -> Result<Vec<VersionEntry>>;

    async fn load_object_metadata(&self, cid: &str) -> Result<Option<ObjectMetadata>>;

    /// Reverse lookup through the CID map.
    async fn record_for_cid(&self, cid: &str) -> Result<Option<Uuid>>;

    /// Idempotent upsert keyed by (record_id, grantee_id, action).
    async fn upsert_permission(&self, permission: &Permission) -> Result<()>;

    /// Flip every grant for the grantee on this record inactive. Revoking a
    /// non-existent grant is a no-op.
    async fn deactivate_permissions(&self, record_id: Uuid, grantee_id: &str) -> Result<()>;

    /// The effective grant, if one exists and is active and unexpired.
    async fn effective_permission(
        &self,
        record_id: Uuid,
        grantee_id: &str,
        action: PermissionAction,
    ) -> Result<Option<Permission>>;

    async fn record_data_key(&self, row: &DataKeyRow) -> Result<()>;

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()>;

    async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>>;
}

/// Metadata store configuration from the environment.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub pool_size: u32,
    /// Full connection URLs for read replicas.
    pub read_replicas: Vec<String>,
    pub slow_query_ms: u64,
}

impl DbConfig {
    pub fn from_env() -> Self {
        Self {
            host: env_string("DB_HOST", "127.0.0.1"),
            port: env_parse("DB_PORT", 5432u16),
            user: env_string("DB_USER", "custody"),
            password: env_string("DB_PASSWORD", "custody"),
            name: env_string("DB_NAME", "custody"),
            pool_size: env_parse("DB_POOL_SIZE", 10u32),
            read_replicas: env_csv("DB_READ_REPLICAS"),
            slow_query_ms: env_parse("DB_SLOW_QUERY_MS", 200u64),
        }
    }

    pub fn primary_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}
