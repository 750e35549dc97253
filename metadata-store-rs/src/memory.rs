// metadata-store-rs/src/memory.rs
//
// In-memory backend for tests and LIGHT_MODE development. A single write
// lock over the whole state makes bundle commits atomic by construction.

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use shared_types::{
    AuditEntry, ObjectMetadata, Permission, PermissionAction, Record, RecordStatus, VersionEntry,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{DataKeyRow, MetadataStore};

#[derive(Default)]
struct Inner {
    records: HashMap<Uuid, Record>,
    versions: HashMap<Uuid, Vec<VersionEntry>>,
    objects: HashMap<String, ObjectMetadata>,
    cid_map: HashMap<String, Uuid>,
    permissions: HashMap<(Uuid, String, PermissionAction), Permission>,
    data_keys: HashMap<String, DataKeyRow>,
    audit: Vec<AuditEntry>,
}

#[derive(Default)]
pub struct MemoryMetadataStore {
    inner: RwLock<Inner>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        true
    }

    async fn commit_record_bundle(
        &self,
        record: &Record,
        version: &VersionEntry,
        object: &ObjectMetadata,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let chain = inner.versions.entry(record.record_id).or_default();
        if chain.iter().any(|v| v.version == version.version) {
            bail!(
                "version {} already committed for record {}",
                version.version,
                record.record_id
            );
        }
        chain.push(version.clone());
        inner.records.insert(record.record_id, record.clone());
        inner
            .objects
            .insert(record.primary_cid.clone(), object.clone());
        inner
            .cid_map
            .insert(record.primary_cid.clone(), record.record_id);
        Ok(())
    }

    async fn load_record(&self, record_id: Uuid) -> Result<Option<Record>> {
        Ok(self.inner.read().await.records.get(&record_id).cloned())
    }

    async fn update_record_status(&self, record_id: Uuid, status: RecordStatus) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.records.get_mut(&record_id) {
            Some(record) => {
                record.status = status;
                record.updated_at = Utc::now();
                Ok(())
            }
            None => bail!("record {record_id} not found"),
        }
    }

    async fn records_for_patient(&self, patient_id: &str) -> Result<Vec<Record>> {
        Ok(self
            .inner
            .read()
            .await
            .records
            .values()
            .filter(|r| r.patient_id == patient_id)
            .cloned()
            .collect())
    }

    async fn load_versions(&self, record_id: Uuid) -> Result<Vec<VersionEntry>> {
        let mut versions = self
            .inner
            .read()
            .await
            .versions
            .get(&record_id)
            .cloned()
            .unwrap_or_default();
        versions.sort_by_key(|v| v.version);
        Ok(versions)
    }

    async fn load_object_metadata(&self, cid: &str) -> Result<Option<ObjectMetadata>> {
        Ok(self.inner.read().await.objects.get(cid).cloned())
    }

    async fn record_for_cid(&self, cid: &str) -> Result<Option<Uuid>> {
        Ok(self.inner.read().await.cid_map.get(cid).copied())
    }

    async fn upsert_permission(&self, permission: &Permission) -> Result<()> {
        let key = (
            permission.record_id,
            permission.grantee_id.clone(),
            permission.action,
        );
        self.inner
            .write()
            .await
            .permissions
            .insert(key, permission.clone());
        Ok(())
    }

    async fn deactivate_permissions(&self, record_id: Uuid, grantee_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        for ((rid, gid, _), permission) in inner.permissions.iter_mut() {
            if *rid == record_id && gid.as_str() == grantee_id {
                permission.is_active = false;
            }
        }
        Ok(())
    }

    async fn effective_permission(
        &self,
        record_id: Uuid,
        grantee_id: &str,
        action: PermissionAction,
    ) -> Result<Option<Permission>> {
        let inner = self.inner.read().await;
        Ok(inner
            .permissions
            .get(&(record_id, grantee_id.to_string(), action))
            .filter(|p| p.is_effective(Utc::now()))
            .cloned())
    }

    async fn record_data_key(&self, row: &DataKeyRow) -> Result<()> {
        self.inner
            .write()
            .await
            .data_keys
            .insert(row.key_id.clone(), row.clone());
        Ok(())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        self.inner.write().await.audit.push(entry.clone());
        Ok(())
    }

    async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let inner = self.inner.read().await;
        let mut out: Vec<AuditEntry> = inner.audit.iter().rev().take(limit).cloned().collect();
        out.reverse();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::{FileType, PinState, Severity};

    fn record(record_id: Uuid, version: u64, cid: &str) -> Record {
        Record {
            record_id,
            patient_id: "p1".into(),
            creator_id: "d1".into(),
            title: "x".into(),
            description: String::new(),
            file_type: FileType::Other,
            content_hash: "00".into(),
            primary_cid: cid.into(),
            data_key_id: "key-1".into(),
            version_number: version,
            merkle_root: "11".into(),
            status: RecordStatus::Active,
            ledger_tx_id: Some("tx-1".into()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn object(cid: &str) -> ObjectMetadata {
        ObjectMetadata {
            file_name: "f".into(),
            content_hash: "00".into(),
            file_size: 5,
            mime_type: "application/octet-stream".into(),
            chunk_count: 1,
            chunk_cids: vec![format!("{cid}-chunk0")],
            iv: "00".into(),
            auth_tag: "00".into(),
            encryption_algorithm: "AES-256-GCM".into(),
            data_key_id: None,
            created_at: Utc::now(),
            pin_state: PinState::Pinned,
            replication_count: 3,
        }
    }

    fn permission(record_id: Uuid, grantee: &str) -> Permission {
        Permission {
            record_id,
            grantee_id: grantee.into(),
            action: PermissionAction::Read,
            granted_by: "d1".into(),
            granted_at: Utc::now(),
            expires_at: None,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn bundle_commit_and_loads() {
        let store = MemoryMetadataStore::new();
        let record_id = Uuid::new_v4();
        let v1 = VersionEntry::seal(1, "cid-1", "d1", Utc::now(), "");
        store
            .commit_record_bundle(&record(record_id, 1, "cid-1"), &v1, &object("cid-1"))
            .await
            .unwrap();

        assert!(store.load_record(record_id).await.unwrap().is_some());
        assert_eq!(store.load_versions(record_id).await.unwrap().len(), 1);
        assert_eq!(
            store.record_for_cid("cid-1").await.unwrap(),
            Some(record_id)
        );
        assert!(store
            .load_object_metadata("cid-1")
            .await
            .unwrap()
            .is_some());

        // A second commit of the same version number is rejected.
        assert!(store
            .commit_record_bundle(&record(record_id, 1, "cid-1"), &v1, &object("cid-1"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn permission_upsert_is_idempotent() {
        let store = MemoryMetadataStore::new();
        let record_id = Uuid::new_v4();
        let grant = permission(record_id, "d2");
        store.upsert_permission(&grant).await.unwrap();
        store.upsert_permission(&grant).await.unwrap();

        let found = store
            .effective_permission(record_id, "d2", PermissionAction::Read)
            .await
            .unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn revoking_missing_grant_is_noop() {
        let store = MemoryMetadataStore::new();
        store
            .deactivate_permissions(Uuid::new_v4(), "nobody")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn deactivation_hides_the_grant() {
        let store = MemoryMetadataStore::new();
        let record_id = Uuid::new_v4();
        store
            .upsert_permission(&permission(record_id, "d2"))
            .await
            .unwrap();
        store.deactivate_permissions(record_id, "d2").await.unwrap();
        assert!(store
            .effective_permission(record_id, "d2", PermissionAction::Read)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn expired_grant_is_not_effective() {
        let store = MemoryMetadataStore::new();
        let record_id = Uuid::new_v4();
        let mut grant = permission(record_id, "d2");
        grant.expires_at = Some(Utc::now() - chrono::Duration::minutes(5));
        store.upsert_permission(&grant).await.unwrap();
        assert!(store
            .effective_permission(record_id, "d2", PermissionAction::Read)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn audit_is_append_only_and_ordered() {
        let store = MemoryMetadataStore::new();
        for i in 0..5 {
            store
                .append_audit(&AuditEntry::new(
                    "u1",
                    format!("action-{i}"),
                    "r",
                    Severity::Low,
                    serde_json::json!({}),
                ))
                .await
                .unwrap();
        }
        let recent = store.recent_audit(3).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].action, "action-2");
        assert_eq!(recent[2].action, "action-4");
    }
}
