// record-pipeline-rs/src/pipeline.rs
//
// Orchestration of the record lifecycle.
//
// Write path: key issue -> encrypted chunked put -> version commit ->
// ledger submit -> metadata bundle commit, with compensation on partial
// failure (unpin + key revoke when the ledger refuses; reconcile-from-ledger
// repair when the local commit fails after ledger acceptance).
//
// Read path: policy decision -> metadata resolve (ledger fallback) -> key
// unwrap -> chunk fetch + decrypt + hash verify -> optional chain proof.
//
// Writes to one record are serialized by a per-record lock; nothing is
// ordered across records.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use key_custody::KeyCustody;
use ledger_gateway::{LedgerError, LedgerGateway};
use merkle::{chain_is_valid, version_chain_root};
use metadata_store::{DataKeyRow, MetadataStore};
use object_store::{DataKey, ObjectStoreClient};
use policy_engine::{PolicyEngine, RequestAttrs, Resource};
use serde_json::{json, Value};
use shared_types::{
    format_timestamp, AuditEntry, CustodyError, ErrorKind, FileType, PermissionAction, Record,
    RecordStatus, Result, Severity, VersionEntry,
};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Caller-supplied request context, carried into policy conditions and the
/// audit trail.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub source_ip: Option<IpAddr>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreateRecordRequest {
    pub patient_id: String,
    pub creator_id: String,
    pub title: String,
    pub description: String,
    pub file: Vec<u8>,
    pub file_type: FileType,
}

/// Result of a read: the header, the plaintext, and the chain verdict when
/// the caller asked for an integrity proof.
#[derive(Debug)]
pub struct ReadOutcome {
    pub record: Record,
    pub plaintext: Vec<u8>,
    pub chain_verified: Option<bool>,
}

pub struct RecordService {
    store: Arc<dyn MetadataStore>,
    objects: Arc<ObjectStoreClient>,
    custody: Arc<KeyCustody>,
    ledger: Arc<LedgerGateway>,
    policy: Arc<PolicyEngine>,
    /// Per-record write serialization.
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl RecordService {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        objects: Arc<ObjectStoreClient>,
        custody: Arc<KeyCustody>,
        ledger: Arc<LedgerGateway>,
        policy: Arc<PolicyEngine>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            objects,
            custody,
            ledger,
            policy,
            locks: DashMap::new(),
        })
    }

    fn lock_for(&self, record_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(record_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn attrs(&self, ctx: &RequestContext) -> RequestAttrs {
        RequestAttrs {
            source_ip: ctx.source_ip,
            grant_expires_at: None,
            at: None,
        }
    }

    async fn audit(
        &self,
        user: &str,
        action: &str,
        resource: &str,
        severity: Severity,
        detail: Value,
        ctx: &RequestContext,
        tx_id: Option<String>,
    ) {
        let mut entry = AuditEntry::new(user, action, resource, severity, detail);
        entry.ip = ctx.source_ip.map(|ip| ip.to_string());
        entry.user_agent = ctx.user_agent.clone();
        entry.ledger_tx_id = tx_id;
        if let Err(e) = self.store.append_audit(&entry).await {
            error!(error = %format!("{e:#}"), "audit append failed");
        }
    }

    /// Ingest a new record.
    pub async fn create_record(
        &self,
        request: CreateRecordRequest,
        ctx: &RequestContext,
    ) -> Result<Record> {
        if request.patient_id.trim().is_empty() || request.creator_id.trim().is_empty() {
            return Err(CustodyError::invalid_input(
                "patient_id and creator_id are required",
            ));
        }
        let record_id = Uuid::new_v4();
        let lock = self.lock_for(record_id);
        let _guard = lock.lock().await;

        let data_key_id = self
            .custody
            .issue(&request.creator_id, "data-encryption", None)
            .await?;
        let material = self.custody.unwrap_key(&data_key_id).await?;

        let put = self
            .objects
            .put(
                &request.file,
                &request.title,
                mime_for(request.file_type),
                Some(DataKey {
                    key_id: Some(data_key_id.clone()),
                    material,
                }),
            )
            .await?;

        let now = Utc::now();
        let version = VersionEntry::seal(1, put.primary_cid.clone(), &request.creator_id, now, "");
        let merkle_root = version_chain_root(std::slice::from_ref(&version))
            .ok_or_else(|| CustodyError::internal("empty version chain"))?;

        let payload = json!({
            "record_id": record_id.to_string(),
            "patient_id": request.patient_id,
            "creator_id": request.creator_id,
            "ipfs_cid": put.primary_cid,
            "content_hash": put.content_hash,
            "timestamp": format_timestamp(&now),
        })
        .to_string();

        let tx_id = match self
            .ledger
            .submit_with_fallback("CreateMedicalRecord", "CreateRecord", &[payload])
            .await
        {
            Ok(tx_id) => tx_id,
            Err(e) => {
                // Ledger refused: the stored object is garbage and the key
                // must not linger.
                warn!(record = %record_id, error = %e, "ledger rejected create; compensating");
                self.objects.schedule_unpin(put.primary_cid.clone());
                if let Err(revoke_err) = self.custody.revoke(&data_key_id).await {
                    error!(key = %data_key_id, error = %revoke_err, "compensating key revoke failed");
                }
                return Err(e.into());
            }
        };

        let record = Record {
            record_id,
            patient_id: request.patient_id.clone(),
            creator_id: request.creator_id.clone(),
            title: request.title.clone(),
            description: request.description.clone(),
            file_type: request.file_type,
            content_hash: put.content_hash.clone(),
            primary_cid: put.primary_cid.clone(),
            data_key_id: data_key_id.clone(),
            version_number: 1,
            merkle_root,
            status: RecordStatus::Active,
            ledger_tx_id: Some(tx_id.clone()),
            created_at: now,
            updated_at: now,
        };
        let object = self.objects.get_metadata(&put.primary_cid).await?;

        if let Err(e) = self
            .store
            .commit_record_bundle(&record, &version, &object)
            .await
        {
            // Ledger accepted but the local commit failed: the ledger is
            // authoritative, so repair instead of unwinding.
            error!(record = %record_id, error = %format!("{e:#}"), "local commit failed after ledger accept; scheduling repair");
            self.spawn_commit_repair(record.clone(), version.clone(), object.clone());
        }

        if let Err(e) = self
            .store
            .record_data_key(&DataKeyRow {
                key_id: data_key_id,
                owner: request.creator_id.clone(),
                purpose: "data-encryption".to_string(),
                created_at: now,
                is_active: true,
            })
            .await
        {
            warn!(error = %format!("{e:#}"), "data key bookkeeping failed");
        }

        self.audit(
            &request.creator_id,
            "record.create",
            &record_id.to_string(),
            Severity::Low,
            json!({"cid": record.primary_cid, "size": put.size}),
            ctx,
            Some(tx_id),
        )
        .await;
        info!(record = %record_id, cid = %record.primary_cid, "record created");
        Ok(record)
    }

    /// Read a record's plaintext, optionally with a version-chain proof.
    pub async fn read_record(
        &self,
        record_id: Uuid,
        caller: &str,
        ctx: &RequestContext,
        want_integrity: bool,
    ) -> Result<ReadOutcome> {
        let decision = self
            .policy
            .decide(caller, "read", &Resource::record(record_id.to_string()), &self.attrs(ctx))
            .await;
        if !decision.is_allow() {
            self.audit(
                caller,
                "record.read.denied",
                &record_id.to_string(),
                Severity::Medium,
                json!({"reason": decision.reason}),
                ctx,
                None,
            )
            .await;
            return Err(CustodyError::forbidden(format!(
                "read denied: {}",
                decision.reason
            )));
        }

        let record = match self
            .store
            .load_record(record_id)
            .await
            .map_err(storage_err)?
        {
            Some(record) => record,
            None => self
                .reconcile_from_ledger(record_id)
                .await?
                .ok_or_else(|| CustodyError::not_found(format!("record {record_id}")))?,
        };

        let material = self.custody.unwrap_for_decrypt(&record.data_key_id).await?;
        let plaintext = match self.objects.get(&record.primary_cid, &material).await {
            Ok(plaintext) => plaintext,
            Err(e) => {
                let mapped: CustodyError = e.into();
                if mapped.kind == ErrorKind::IntegrityViolation {
                    self.audit(
                        caller,
                        "record.read.integrity_violation",
                        &record_id.to_string(),
                        Severity::High,
                        json!({"cid": record.primary_cid, "error": mapped.to_string()}),
                        ctx,
                        None,
                    )
                    .await;
                }
                return Err(mapped);
            }
        };

        let chain_verified = if want_integrity {
            let versions = self
                .store
                .load_versions(record_id)
                .await
                .map_err(storage_err)?;
            let ok = chain_is_valid(&versions)
                && version_chain_root(&versions).as_deref() == Some(record.merkle_root.as_str());
            if !ok {
                self.audit(
                    caller,
                    "record.chain.broken",
                    &record_id.to_string(),
                    Severity::High,
                    json!({"versions": versions.len()}),
                    ctx,
                    None,
                )
                .await;
            }
            Some(ok)
        } else {
            None
        };

        self.audit(
            caller,
            "record.read",
            &record_id.to_string(),
            Severity::Low,
            json!({"reason": decision.reason}),
            ctx,
            None,
        )
        .await;
        Ok(ReadOutcome {
            record,
            plaintext,
            chain_verified,
        })
    }

    /// Append a new version to an existing record.
    pub async fn create_version(
        &self,
        record_id: Uuid,
        creator_id: &str,
        file: Vec<u8>,
        ctx: &RequestContext,
    ) -> Result<Record> {
        let lock = self.lock_for(record_id);
        let _guard = lock.lock().await;

        let record = self
            .store
            .load_record(record_id)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| CustodyError::not_found(format!("record {record_id}")))?;
        if !record.status.accepts_writes() {
            self.audit(
                creator_id,
                "record.write.rejected",
                &record_id.to_string(),
                Severity::Medium,
                json!({"status": "ARCHIVED"}),
                ctx,
                None,
            )
            .await;
            return Err(CustodyError::conflict("archived record rejects writes"));
        }

        let decision = self
            .policy
            .decide(creator_id, "write", &Resource::record(record_id.to_string()), &self.attrs(ctx))
            .await;
        if !decision.is_allow() {
            return Err(CustodyError::forbidden(format!(
                "write denied: {}",
                decision.reason
            )));
        }

        let material = self.custody.unwrap_key(&record.data_key_id).await?;
        let put = self
            .objects
            .put(
                &file,
                &record.title,
                mime_for(record.file_type),
                Some(DataKey {
                    key_id: Some(record.data_key_id.clone()),
                    material,
                }),
            )
            .await?;

        let versions = self
            .store
            .load_versions(record_id)
            .await
            .map_err(storage_err)?;
        let previous = versions
            .last()
            .ok_or_else(|| CustodyError::internal("record exists without versions"))?;
        let now = Utc::now();
        let version = VersionEntry::seal(
            previous.version + 1,
            put.primary_cid.clone(),
            creator_id,
            now,
            previous.hash.clone(),
        );
        let mut chain = versions.clone();
        chain.push(version.clone());
        let merkle_root = version_chain_root(&chain)
            .ok_or_else(|| CustodyError::internal("empty version chain"))?;

        let payload = json!({
            "record_id": record_id.to_string(),
            "patient_id": record.patient_id,
            "creator_id": creator_id,
            "ipfs_cid": put.primary_cid,
            "content_hash": put.content_hash,
            "timestamp": format_timestamp(&now),
        })
        .to_string();
        let tx_id = match self
            .ledger
            .submit_with_fallback("CreateMedicalRecord", "CreateRecord", &[payload])
            .await
        {
            Ok(tx_id) => tx_id,
            Err(e) => {
                warn!(record = %record_id, error = %e, "ledger rejected version; compensating");
                self.objects.schedule_unpin(put.primary_cid.clone());
                return Err(e.into());
            }
        };

        let updated = Record {
            content_hash: put.content_hash.clone(),
            primary_cid: put.primary_cid.clone(),
            version_number: version.version,
            merkle_root,
            ledger_tx_id: Some(tx_id.clone()),
            updated_at: now,
            ..record
        };
        let object = self.objects.get_metadata(&put.primary_cid).await?;
        if let Err(e) = self
            .store
            .commit_record_bundle(&updated, &version, &object)
            .await
        {
            error!(record = %record_id, error = %format!("{e:#}"), "local commit failed after ledger accept; scheduling repair");
            self.spawn_commit_repair(updated.clone(), version.clone(), object.clone());
        }

        self.audit(
            creator_id,
            "record.version.create",
            &record_id.to_string(),
            Severity::Low,
            json!({"version": version.version, "cid": updated.primary_cid}),
            ctx,
            Some(tx_id),
        )
        .await;
        Ok(updated)
    }

    /// Submit a grant on the ledger. The local permission row is written by
    /// the event consumer when AccessGranted arrives.
    pub async fn grant_access(
        &self,
        record_id: Uuid,
        caller: &str,
        grantee_id: &str,
        action: PermissionAction,
        expires_at: Option<DateTime<Utc>>,
        ctx: &RequestContext,
    ) -> Result<String> {
        if grantee_id.trim().is_empty() {
            return Err(CustodyError::invalid_input("grantee_id is required"));
        }
        self.require_record(record_id).await?;
        self.require_allow(caller, "admin", record_id, ctx).await?;

        let mut args = vec![
            record_id.to_string(),
            grantee_id.to_string(),
            action.as_str().to_string(),
        ];
        if let Some(expires) = expires_at {
            args.push(format_timestamp(&expires));
        }
        let tx_id = self.ledger.submit("GrantAccess", &args).await?;

        self.audit(
            caller,
            "access.grant",
            &record_id.to_string(),
            Severity::Low,
            json!({"grantee": grantee_id, "action": action.as_str()}),
            ctx,
            Some(tx_id.clone()),
        )
        .await;
        Ok(tx_id)
    }

    /// Submit a revocation on the ledger; mirror of [`Self::grant_access`].
    pub async fn revoke_access(
        &self,
        record_id: Uuid,
        caller: &str,
        grantee_id: &str,
        ctx: &RequestContext,
    ) -> Result<String> {
        self.require_record(record_id).await?;
        self.require_allow(caller, "admin", record_id, ctx).await?;

        let tx_id = self
            .ledger
            .submit(
                "RevokeAccess",
                &[record_id.to_string(), grantee_id.to_string()],
            )
            .await?;

        self.audit(
            caller,
            "access.revoke",
            &record_id.to_string(),
            Severity::Low,
            json!({"grantee": grantee_id}),
            ctx,
            Some(tx_id.clone()),
        )
        .await;
        Ok(tx_id)
    }

    /// Move a record into its terminal state.
    pub async fn archive_record(
        &self,
        record_id: Uuid,
        caller: &str,
        ctx: &RequestContext,
    ) -> Result<()> {
        let lock = self.lock_for(record_id);
        let _guard = lock.lock().await;

        let record = self
            .store
            .load_record(record_id)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| CustodyError::not_found(format!("record {record_id}")))?;
        self.require_allow(caller, "admin", record_id, ctx).await?;
        if !record.status.can_transition_to(RecordStatus::Archived) {
            return Err(CustodyError::conflict(format!(
                "cannot archive a record in {:?} state",
                record.status
            )));
        }
        self.store
            .update_record_status(record_id, RecordStatus::Archived)
            .await
            .map_err(storage_err)?;
        self.audit(
            caller,
            "record.archive",
            &record_id.to_string(),
            Severity::Low,
            json!({}),
            ctx,
            None,
        )
        .await;
        Ok(())
    }

    /// Recompute the version chain locally and cross-check the ledger's
    /// integrity verdict.
    pub async fn verify_record(&self, record_id: Uuid, caller: &str) -> Result<bool> {
        let record = self
            .store
            .load_record(record_id)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| CustodyError::not_found(format!("record {record_id}")))?;
        let versions = self
            .store
            .load_versions(record_id)
            .await
            .map_err(storage_err)?;
        let local_ok = chain_is_valid(&versions)
            && version_chain_root(&versions).as_deref() == Some(record.merkle_root.as_str());

        let ledger_ok = match self
            .ledger
            .evaluate_with_fallback(
                "ValidateRecordIntegrity",
                "VerifyRecord",
                &[record_id.to_string()],
            )
            .await
        {
            Ok(raw) => raw == b"true",
            Err(LedgerError::NotFound(_)) => false,
            Err(e) => return Err(e.into()),
        };

        if !(local_ok && ledger_ok) {
            self.audit(
                caller,
                "record.verify.failed",
                &record_id.to_string(),
                Severity::High,
                json!({"local_ok": local_ok, "ledger_ok": ledger_ok}),
                &RequestContext::default(),
                None,
            )
            .await;
        }
        Ok(local_ok && ledger_ok)
    }

    /// Rebuild local metadata for a record the ledger knows about. Returns
    /// `None` when the ledger has no such record either.
    pub async fn reconcile_from_ledger(&self, record_id: Uuid) -> Result<Option<Record>> {
        let raw = match self
            .ledger
            .evaluate_with_fallback("ReadRecord", "GetRecord", &[record_id.to_string()])
            .await
        {
            Ok(raw) => raw,
            Err(LedgerError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let payload: Value = serde_json::from_slice(&raw)
            .map_err(|e| CustodyError::new(ErrorKind::LedgerError, format!("bad ledger record: {e}")))?;
        let field = |name: &str| -> Result<String> {
            payload
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    CustodyError::new(
                        ErrorKind::LedgerError,
                        format!("ledger record missing {name}"),
                    )
                })
        };
        let cid = field("ipfs_cid")?;
        let creator_id = field("creator_id")?;
        let patient_id = field("patient_id")?;
        let content_hash = field("content_hash")?;
        let timestamp = field("timestamp")?
            .parse::<DateTime<Utc>>()
            .map_err(|e| CustodyError::new(ErrorKind::LedgerError, format!("bad timestamp: {e}")))?;

        let object = self.objects.get_metadata(&cid).await?;
        let data_key_id = object.data_key_id.clone().ok_or_else(|| {
            CustodyError::new(
                ErrorKind::LedgerError,
                "object metadata carries no data key id; cannot reconcile",
            )
        })?;

        let version = VersionEntry::seal(1, cid.clone(), &creator_id, timestamp, "");
        let merkle_root = version_chain_root(std::slice::from_ref(&version))
            .ok_or_else(|| CustodyError::internal("empty version chain"))?;
        let record = Record {
            record_id,
            patient_id,
            creator_id,
            title: String::new(),
            description: "recovered from ledger".to_string(),
            file_type: FileType::Other,
            content_hash,
            primary_cid: cid,
            data_key_id,
            version_number: 1,
            merkle_root,
            status: RecordStatus::Active,
            ledger_tx_id: None,
            created_at: timestamp,
            updated_at: Utc::now(),
        };
        self.store
            .commit_record_bundle(&record, &version, &object)
            .await
            .map_err(storage_err)?;
        info!(record = %record_id, "record reconciled from ledger");
        Ok(Some(record))
    }

    async fn require_record(&self, record_id: Uuid) -> Result<Record> {
        self.store
            .load_record(record_id)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| CustodyError::not_found(format!("record {record_id}")))
    }

    async fn require_allow(
        &self,
        caller: &str,
        action: &str,
        record_id: Uuid,
        ctx: &RequestContext,
    ) -> Result<()> {
        let decision = self
            .policy
            .decide(caller, action, &Resource::record(record_id.to_string()), &self.attrs(ctx))
            .await;
        if !decision.is_allow() {
            self.audit(
                caller,
                &format!("record.{action}.denied"),
                &record_id.to_string(),
                Severity::Medium,
                json!({"reason": decision.reason}),
                ctx,
                None,
            )
            .await;
            return Err(CustodyError::forbidden(format!(
                "{action} denied: {}",
                decision.reason
            )));
        }
        Ok(())
    }

    /// Retry a failed bundle commit in the background. The ledger already
    /// accepted the record, so local state must converge.
    fn spawn_commit_repair(
        &self,
        record: Record,
        version: VersionEntry,
        object: shared_types::ObjectMetadata,
    ) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            for attempt in 1..=3u32 {
                tokio::time::sleep(std::time::Duration::from_secs(2u64.pow(attempt))).await;
                match store.commit_record_bundle(&record, &version, &object).await {
                    Ok(()) => {
                        info!(record = %record.record_id, attempt, "commit repair succeeded");
                        return;
                    }
                    Err(e) => {
                        warn!(record = %record.record_id, attempt, error = %format!("{e:#}"), "commit repair attempt failed")
                    }
                }
            }
            error!(record = %record.record_id, "commit repair exhausted; operator attention required");
        });
    }
}

fn storage_err(e: anyhow::Error) -> CustodyError {
    CustodyError::new(ErrorKind::StorageError, format!("{e:#}"))
}

fn mime_for(file_type: FileType) -> &'static str {
    match file_type {
        FileType::Pdf => "application/pdf",
        FileType::Dicom => "application/dicom",
        FileType::Image => "image/jpeg",
        FileType::Other => "application/octet-stream",
    }
}
