// metadata-store-rs/src/postgres.rs
//
// PostgreSQL backend.
//
// Writes always hit the primary; reads round-robin across healthy replica
// pools and fall back to the primary when a replica fails mid-query. Slow
// statements are logged with truncated SQL and parameters.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use shared_types::{
    AuditEntry, FileType, ObjectMetadata, Permission, PermissionAction, PinState, Record,
    RecordStatus, Severity, VersionEntry,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{DataKeyRow, DbConfig, MetadataStore};

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS records (
        record_id UUID PRIMARY KEY,
        patient_id TEXT NOT NULL,
        creator_id TEXT NOT NULL,
        title TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        file_type TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        primary_cid TEXT NOT NULL,
        data_key_id TEXT NOT NULL,
        version_number BIGINT NOT NULL,
        merkle_root TEXT NOT NULL,
        status TEXT NOT NULL,
        ledger_tx_id TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_records_patient ON records(patient_id)",
    "CREATE INDEX IF NOT EXISTS idx_records_creator ON records(creator_id)",
    r#"CREATE TABLE IF NOT EXISTS record_versions (
        record_id UUID NOT NULL,
        version BIGINT NOT NULL,
        cid TEXT NOT NULL,
        hash TEXT NOT NULL,
        creator_id TEXT NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL,
        previous_hash TEXT NOT NULL,
        PRIMARY KEY (record_id, version)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS object_metadata (
        cid TEXT PRIMARY KEY,
        file_name TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        file_size BIGINT NOT NULL,
        mime_type TEXT NOT NULL,
        chunk_count BIGINT NOT NULL,
        chunk_cids JSONB NOT NULL,
        iv TEXT NOT NULL,
        auth_tag TEXT NOT NULL,
        encryption_algorithm TEXT NOT NULL,
        data_key_id TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        pin_state TEXT NOT NULL,
        replication_count INT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS data_keys (
        key_id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        purpose TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        is_active BOOLEAN NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS access_permissions (
        record_id UUID NOT NULL,
        grantee_id TEXT NOT NULL,
        action TEXT NOT NULL,
        granted_by TEXT NOT NULL,
        granted_at TIMESTAMPTZ NOT NULL,
        expires_at TIMESTAMPTZ,
        is_active BOOLEAN NOT NULL,
        PRIMARY KEY (record_id, grantee_id, action)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_permissions_record_grantee ON access_permissions(record_id, grantee_id)",
    r#"CREATE TABLE IF NOT EXISTS audit_log (
        log_id UUID PRIMARY KEY,
        user_id TEXT NOT NULL,
        action TEXT NOT NULL,
        resource TEXT NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL,
        ip TEXT,
        user_agent TEXT,
        detail JSONB NOT NULL,
        ledger_tx_id TEXT,
        severity TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp)",
    r#"CREATE TABLE IF NOT EXISTS cid_record_map (
        cid TEXT PRIMARY KEY,
        record_id UUID NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_cid_map_record ON cid_record_map(record_id)",
];

struct Replica {
    url: String,
    pool: PgPool,
    healthy: AtomicBool,
}

pub struct PgMetadataStore {
    primary: PgPool,
    replicas: Vec<Replica>,
    cursor: AtomicUsize,
    slow_threshold: Duration,
}

impl PgMetadataStore {
    pub async fn connect(config: &DbConfig) -> Result<Self> {
        let primary = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .connect(&config.primary_url())
            .await
            .context("failed to connect to primary database")?;

        let mut replicas = Vec::new();
        for url in &config.read_replicas {
            match PgPoolOptions::new()
                .max_connections(config.pool_size)
                .connect(url)
                .await
            {
                Ok(pool) => replicas.push(Replica {
                    url: url.clone(),
                    pool,
                    healthy: AtomicBool::new(true),
                }),
                Err(e) => warn!(replica = %url, error = %e, "read replica unavailable at startup"),
            }
        }
        info!(replicas = replicas.len(), "metadata store connected");
        Ok(Self {
            primary,
            replicas,
            cursor: AtomicUsize::new(0),
            slow_threshold: Duration::from_millis(config.slow_query_ms),
        })
    }

    /// Probe replicas once, re-admitting recovered pools.
    pub async fn probe_replicas(&self) {
        for replica in &self.replicas {
            let alive = sqlx::query("SELECT 1").execute(&replica.pool).await.is_ok();
            let was = replica.healthy.swap(alive, Ordering::SeqCst);
            if was != alive {
                if alive {
                    info!(replica = %replica.url, "read replica recovered");
                } else {
                    warn!(replica = %replica.url, "read replica down");
                }
            }
        }
    }

    fn pick_replica(&self) -> Option<(usize, &PgPool)> {
        if self.replicas.is_empty() {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..self.replicas.len() {
            let index = (start + offset) % self.replicas.len();
            if self.replicas[index].healthy.load(Ordering::SeqCst) {
                return Some((index, &self.replicas[index].pool));
            }
        }
        None
    }

    /// Run a read on a healthy replica, falling back to the primary when
    /// the replica fails mid-query.
    async fn on_read_pool<T>(
        &self,
        op: impl for<'a> Fn(&'a PgPool) -> BoxFuture<'a, Result<T, sqlx::Error>>,
    ) -> Result<T, sqlx::Error> {
        if let Some((index, pool)) = self.pick_replica() {
            match op(pool).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(error = %e, "replica read failed; falling back to primary");
                    self.replicas[index].healthy.store(false, Ordering::SeqCst);
                }
            }
        }
        op(&self.primary).await
    }

    fn observe(&self, sql: &str, params: &[String], started: Instant) {
        let elapsed = started.elapsed();
        if elapsed >= self.slow_threshold {
            let shown: Vec<String> = params.iter().take(5).map(|p| truncate(p, 64)).collect();
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                sql = %truncate(sql, 120),
                params = ?shown,
                "slow query"
            );
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let shown: String = s.chars().take(max).collect();
        format!("{shown}…")
    }
}

fn status_str(status: RecordStatus) -> &'static str {
    match status {
        RecordStatus::Draft => "DRAFT",
        RecordStatus::Active => "ACTIVE",
        RecordStatus::Archived => "ARCHIVED",
    }
}

fn parse_status(raw: &str) -> Result<RecordStatus> {
    match raw {
        "DRAFT" => Ok(RecordStatus::Draft),
        "ACTIVE" => Ok(RecordStatus::Active),
        "ARCHIVED" => Ok(RecordStatus::Archived),
        other => Err(anyhow!("unknown record status {other:?}")),
    }
}

fn file_type_str(file_type: FileType) -> &'static str {
    match file_type {
        FileType::Pdf => "PDF",
        FileType::Dicom => "DICOM",
        FileType::Image => "IMAGE",
        FileType::Other => "OTHER",
    }
}

fn parse_file_type(raw: &str) -> Result<FileType> {
    match raw {
        "PDF" => Ok(FileType::Pdf),
        "DICOM" => Ok(FileType::Dicom),
        "IMAGE" => Ok(FileType::Image),
        "OTHER" => Ok(FileType::Other),
        other => Err(anyhow!("unknown file type {other:?}")),
    }
}

fn pin_state_str(state: PinState) -> &'static str {
    match state {
        PinState::Pinned => "PINNED",
        PinState::Unpinned => "UNPINNED",
    }
}

fn parse_pin_state(raw: &str) -> Result<PinState> {
    match raw {
        "PINNED" => Ok(PinState::Pinned),
        "UNPINNED" => Ok(PinState::Unpinned),
        other => Err(anyhow!("unknown pin state {other:?}")),
    }
}

fn severity_str(severity: Severity) -> &'static str {
    match severity {
        Severity::Low => "LOW",
        Severity::Medium => "MEDIUM",
        Severity::High => "HIGH",
    }
}

fn parse_severity(raw: &str) -> Result<Severity> {
    match raw {
        "LOW" => Ok(Severity::Low),
        "MEDIUM" => Ok(Severity::Medium),
        "HIGH" => Ok(Severity::High),
        other => Err(anyhow!("unknown severity {other:?}")),
    }
}

fn record_from_row(row: &PgRow) -> Result<Record> {
    Ok(Record {
        record_id: row.try_get("record_id")?,
        patient_id: row.try_get("patient_id")?,
        creator_id: row.try_get("creator_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        file_type: parse_file_type(row.try_get::<String, _>("file_type")?.as_str())?,
        content_hash: row.try_get("content_hash")?,
        primary_cid: row.try_get("primary_cid")?,
        data_key_id: row.try_get("data_key_id")?,
        version_number: row.try_get::<i64, _>("version_number")? as u64,
        merkle_root: row.try_get("merkle_root")?,
        status: parse_status(row.try_get::<String, _>("status")?.as_str())?,
        ledger_tx_id: row.try_get("ledger_tx_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn version_from_row(row: &PgRow) -> Result<VersionEntry> {
    Ok(VersionEntry {
        version: row.try_get::<i64, _>("version")? as u64,
        cid: row.try_get("cid")?,
        hash: row.try_get("hash")?,
        creator_id: row.try_get("creator_id")?,
        timestamp: row.try_get("timestamp")?,
        previous_hash: row.try_get("previous_hash")?,
    })
}

fn object_from_row(row: &PgRow) -> Result<ObjectMetadata> {
    let chunk_cids: serde_json::Value = row.try_get("chunk_cids")?;
    Ok(ObjectMetadata {
        file_name: row.try_get("file_name")?,
        content_hash: row.try_get("content_hash")?,
        file_size: row.try_get::<i64, _>("file_size")? as u64,
        mime_type: row.try_get("mime_type")?,
        chunk_count: row.try_get::<i64, _>("chunk_count")? as usize,
        chunk_cids: serde_json::from_value(chunk_cids).context("chunk_cids column")?,
        iv: row.try_get("iv")?,
        auth_tag: row.try_get("auth_tag")?,
        encryption_algorithm: row.try_get("encryption_algorithm")?,
        data_key_id: row.try_get("data_key_id")?,
        created_at: row.try_get("created_at")?,
        pin_state: parse_pin_state(row.try_get::<String, _>("pin_state")?.as_str())?,
        replication_count: row.try_get::<i32, _>("replication_count")? as u32,
    })
}

fn permission_from_row(row: &PgRow) -> Result<Permission> {
    let action_raw: String = row.try_get("action")?;
    Ok(Permission {
        record_id: row.try_get("record_id")?,
        grantee_id: row.try_get("grantee_id")?,
        action: PermissionAction::parse(&action_raw)
            .ok_or_else(|| anyhow!("unknown permission action {action_raw:?}"))?,
        granted_by: row.try_get("granted_by")?,
        granted_at: row.try_get("granted_at")?,
        expires_at: row.try_get("expires_at")?,
        is_active: row.try_get("is_active")?,
    })
}

fn audit_from_row(row: &PgRow) -> Result<AuditEntry> {
    Ok(AuditEntry {
        log_id: row.try_get("log_id")?,
        user_id: row.try_get("user_id")?,
        action: row.try_get("action")?,
        resource: row.try_get("resource")?,
        timestamp: row.try_get("timestamp")?,
        ip: row.try_get("ip")?,
        user_agent: row.try_get("user_agent")?,
        detail: row.try_get("detail")?,
        ledger_tx_id: row.try_get("ledger_tx_id")?,
        severity: parse_severity(row.try_get::<String, _>("severity")?.as_str())?,
    })
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    async fn initialize(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.primary)
                .await
                .with_context(|| format!("schema statement failed: {}", truncate(statement, 60)))?;
        }
        info!("metadata schema ready");
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.primary).await.is_ok()
    }

    async fn commit_record_bundle(
        &self,
        record: &Record,
        version: &VersionEntry,
        object: &ObjectMetadata,
    ) -> Result<()> {
        let started = Instant::now();
        let mut tx = self.primary.begin().await.context("begin bundle tx")?;

        sqlx::query(
            r#"
            INSERT INTO records (record_id, patient_id, creator_id, title, description,
                                 file_type, content_hash, primary_cid, data_key_id,
                                 version_number, merkle_root, status, ledger_tx_id,
                                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (record_id) DO UPDATE SET
                content_hash = $7, primary_cid = $8, data_key_id = $9,
                version_number = $10, merkle_root = $11, status = $12,
                ledger_tx_id = $13, updated_at = $15
            "#,
        )
        .bind(record.record_id)
        .bind(&record.patient_id)
        .bind(&record.creator_id)
        .bind(&record.title)
        .bind(&record.description)
        .bind(file_type_str(record.file_type))
        .bind(&record.content_hash)
        .bind(&record.primary_cid)
        .bind(&record.data_key_id)
        .bind(record.version_number as i64)
        .bind(&record.merkle_root)
        .bind(status_str(record.status))
        .bind(&record.ledger_tx_id)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await
        .context("upsert record")?;

        sqlx::query(
            r#"
            INSERT INTO record_versions (record_id, version, cid, hash, creator_id,
                                         timestamp, previous_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.record_id)
        .bind(version.version as i64)
        .bind(&version.cid)
        .bind(&version.hash)
        .bind(&version.creator_id)
        .bind(version.timestamp)
        .bind(&version.previous_hash)
        .execute(&mut *tx)
        .await
        .context("insert version")?;

        sqlx::query(
            r#"
            INSERT INTO object_metadata (cid, file_name, content_hash, file_size, mime_type,
                                         chunk_count, chunk_cids, iv, auth_tag,
                                         encryption_algorithm, data_key_id, created_at,
                                         pin_state, replication_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (cid) DO NOTHING
            "#,
        )
        .bind(&record.primary_cid)
        .bind(&object.file_name)
        .bind(&object.content_hash)
        .bind(object.file_size as i64)
        .bind(&object.mime_type)
        .bind(object.chunk_count as i64)
        .bind(serde_json::to_value(&object.chunk_cids).context("chunk cids")?)
        .bind(&object.iv)
        .bind(&object.auth_tag)
        .bind(&object.encryption_algorithm)
        .bind(&object.data_key_id)
        .bind(object.created_at)
        .bind(pin_state_str(object.pin_state))
        .bind(object.replication_count as i32)
        .execute(&mut *tx)
        .await
        .context("insert object metadata")?;

        sqlx::query(
            r#"
            INSERT INTO cid_record_map (cid, record_id) VALUES ($1, $2)
            ON CONFLICT (cid) DO NOTHING
            "#,
        )
        .bind(&record.primary_cid)
        .bind(record.record_id)
        .execute(&mut *tx)
        .await
        .context("insert cid mapping")?;

        tx.commit().await.context("commit bundle tx")?;
        self.observe(
            "bundle: records+record_versions+object_metadata+cid_record_map",
            &[record.record_id.to_string(), record.primary_cid.clone()],
            started,
        );
        Ok(())
    }

    async fn load_record(&self, record_id: Uuid) -> Result<Option<Record>> {
        let started = Instant::now();
        let sql = "SELECT * FROM records WHERE record_id = $1";
        let row = self
            .on_read_pool(|pool| {
                Box::pin(async move {
                    sqlx::query(sql).bind(record_id).fetch_optional(pool).await
                })
            })
            .await
            .context("load record")?;
        self.observe(sql, &[record_id.to_string()], started);
        row.map(|r| record_from_row(&r)).transpose()
    }

    async fn update_record_status(&self, record_id: Uuid, status: RecordStatus) -> Result<()> {
        let affected = sqlx::query(
            "UPDATE records SET status = $2, updated_at = $3 WHERE record_id = $1",
        )
        .bind(record_id)
        .bind(status_str(status))
        .bind(Utc::now())
        .execute(&self.primary)
        .await
        .context("update record status")?;
        if affected.rows_affected() == 0 {
            return Err(anyhow!("record {record_id} not found"));
        }
        Ok(())
    }

    async fn records_for_patient(&self, patient_id: &str) -> Result<Vec<Record>> {
        let started = Instant::now();
        let sql = "SELECT * FROM records WHERE patient_id = $1 ORDER BY created_at";
        let rows = self
            .on_read_pool(|pool| {
                let patient_id = patient_id.to_string();
                Box::pin(async move {
                    sqlx::query(sql).bind(patient_id).fetch_all(pool).await
                })
            })
            .await
            .context("records for patient")?;
        self.observe(sql, &[patient_id.to_string()], started);
        rows.iter().map(record_from_row).collect()
    }

    async fn load_versions(&self, record_id: Uuid) -> Result<Vec<VersionEntry>> {
        let started = Instant::now();
        let sql = "SELECT * FROM record_versions WHERE record_id = $1 ORDER BY version";
        let rows = self
            .on_read_pool(|pool| {
                Box::pin(async move {
                    sqlx::query(sql).bind(record_id).fetch_all(pool).await
                })
            })
            .await
            .context("load versions")?;
        self.observe(sql, &[record_id.to_string()], started);
        rows.iter().map(version_from_row).collect()
    }

    async fn load_object_metadata(&self, cid: &str) -> Result<Option<ObjectMetadata>> {
        let sql = "SELECT * FROM object_metadata WHERE cid = $1";
        let row = self
            .on_read_pool(|pool| {
                let cid = cid.to_string();
                Box::pin(async move { sqlx::query(sql).bind(cid).fetch_optional(pool).await })
            })
            .await
            .context("load object metadata")?;
        row.map(|r| object_from_row(&r)).transpose()
    }

    async fn record_for_cid(&self, cid: &str) -> Result<Option<Uuid>> {
        let sql = "SELECT record_id FROM cid_record_map WHERE cid = $1";
        let row = self
            .on_read_pool(|pool| {
                let cid = cid.to_string();
                Box::pin(async move { sqlx::query(sql).bind(cid).fetch_optional(pool).await })
            })
            .await
            .context("cid lookup")?;
        Ok(row.map(|r| r.try_get("record_id")).transpose()?)
    }

    async fn upsert_permission(&self, permission: &Permission) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO access_permissions (record_id, grantee_id, action, granted_by,
                                            granted_at, expires_at, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (record_id, grantee_id, action) DO UPDATE SET
                granted_by = $4, granted_at = $5, expires_at = $6, is_active = $7
            "#,
        )
        .bind(permission.record_id)
        .bind(&permission.grantee_id)
        .bind(permission.action.as_str())
        .bind(&permission.granted_by)
        .bind(permission.granted_at)
        .bind(permission.expires_at)
        .bind(permission.is_active)
        .execute(&self.primary)
        .await
        .context("upsert permission")?;
        Ok(())
    }

    async fn deactivate_permissions(&self, record_id: Uuid, grantee_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE access_permissions SET is_active = FALSE WHERE record_id = $1 AND grantee_id = $2",
        )
        .bind(record_id)
        .bind(grantee_id)
        .execute(&self.primary)
        .await
        .context("deactivate permissions")?;
        Ok(())
    }

    async fn effective_permission(
        &self,
        record_id: Uuid,
        grantee_id: &str,
        action: PermissionAction,
    ) -> Result<Option<Permission>> {
        let sql = r#"
            SELECT * FROM access_permissions
            WHERE record_id = $1 AND grantee_id = $2 AND action = $3
              AND is_active AND (expires_at IS NULL OR expires_at > NOW())
        "#;
        let row = self
            .on_read_pool(|pool| {
                let grantee_id = grantee_id.to_string();
                Box::pin(async move {
                    sqlx::query(sql)
                        .bind(record_id)
                        .bind(grantee_id)
                        .bind(action.as_str())
                        .fetch_optional(pool)
                        .await
                })
            })
            .await
            .context("effective permission")?;
        row.map(|r| permission_from_row(&r)).transpose()
    }

    async fn record_data_key(&self, row: &DataKeyRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO data_keys (key_id, owner_id, purpose, created_at, is_active)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (key_id) DO UPDATE SET is_active = $5
            "#,
        )
        .bind(&row.key_id)
        .bind(&row.owner)
        .bind(&row.purpose)
        .bind(row.created_at)
        .bind(row.is_active)
        .execute(&self.primary)
        .await
        .context("record data key")?;
        Ok(())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (log_id, user_id, action, resource, timestamp, ip,
                                   user_agent, detail, ledger_tx_id, severity)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.log_id)
        .bind(&entry.user_id)
        .bind(&entry.action)
        .bind(&entry.resource)
        .bind(entry.timestamp)
        .bind(&entry.ip)
        .bind(&entry.user_agent)
        .bind(&entry.detail)
        .bind(&entry.ledger_tx_id)
        .bind(severity_str(entry.severity))
        .execute(&self.primary)
        .await
        .context("append audit")?;
        Ok(())
    }

    async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let sql = "SELECT * FROM audit_log ORDER BY timestamp DESC LIMIT $1";
        let rows = self
            .on_read_pool(|pool| {
                Box::pin(async move {
                    sqlx::query(sql).bind(limit as i64).fetch_all(pool).await
                })
            })
            .await
            .context("recent audit")?;
        let mut out: Vec<AuditEntry> = rows.iter().map(audit_from_row).collect::<Result<_>>()?;
        out.reverse();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_caps_and_marks() {
        let long = "x".repeat(200);
        let shown = truncate(&long, 64);
        assert!(shown.chars().count() <= 65);
        assert!(shown.ends_with('…'));
        assert_eq!(truncate("short", 64), "short");
    }

    #[test]
    fn enum_round_trips() {
        for status in [RecordStatus::Draft, RecordStatus::Active, RecordStatus::Archived] {
            assert_eq!(parse_status(status_str(status)).unwrap(), status);
        }
        for ft in [FileType::Pdf, FileType::Dicom, FileType::Image, FileType::Other] {
            assert_eq!(parse_file_type(file_type_str(ft)).unwrap(), ft);
        }
        assert!(parse_status("BOGUS").is_err());
    }
}
