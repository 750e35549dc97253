// record-pipeline-rs/tests/pipeline_flow.rs
//
// End-to-end pipeline flows over the in-memory backends: memory metadata
// store, memory object transport, tempdir key store and the in-process
// ledger, with the real event fan-out wired in between.

use std::sync::Arc;
use std::time::Duration;

use key_custody::{KeyCustody, KeyCustodyConfig};
use ledger_gateway::{InProcessLedger, LedgerConfig, LedgerGateway};
use metadata_store::{MemoryMetadataStore, MetadataStore};
use object_store::{MemoryObjectTransport, ObjectStoreClient, ObjectStoreConfig, CHUNK_SIZE};
use policy_engine::PolicyEngine;
use record_pipeline::{
    CreateRecordRequest, EventFanout, Notifier, PermissionProjector, PolicyCacheInvalidator,
    RecordService, RequestContext,
};
use shared_types::{ErrorKind, FileType, PermissionAction};
use tokio::sync::mpsc;

struct Harness {
    service: Arc<RecordService>,
    store: Arc<MemoryMetadataStore>,
    ledger: Arc<InProcessLedger>,
    objects: Arc<ObjectStoreClient>,
    transport: Arc<MemoryObjectTransport>,
    custody: Arc<KeyCustody>,
    notifications: mpsc::Receiver<record_pipeline::UserNotification>,
    _fanout: tokio::task::JoinHandle<()>,
    _keys_dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let keys_dir = tempfile::tempdir().unwrap();
    let custody = Arc::new(
        KeyCustody::init(KeyCustodyConfig {
            store_path: keys_dir.path().to_path_buf(),
            rotation_interval_days: 90,
            max_key_age_days: 365,
        })
        .await
        .unwrap(),
    );

    let store = Arc::new(MemoryMetadataStore::new());
    let transport = MemoryObjectTransport::new();
    let objects = Arc::new(
        ObjectStoreClient::new(
            Arc::clone(&transport) as _,
            ObjectStoreConfig::for_tests(vec!["node-a".into(), "node-b".into()]),
        )
        .with_custody(Arc::clone(&custody)),
    );

    let ledger = InProcessLedger::new();
    let gateway = LedgerGateway::initialize(Arc::clone(&ledger) as _, LedgerConfig::for_tests())
        .await
        .unwrap();

    let policy = Arc::new(PolicyEngine::new().with_ledger(Arc::clone(&gateway)));
    policy.install_default_policies().await;

    let (notify_tx, notify_rx) = mpsc::channel(64);
    let events = gateway.subscribe_events().await.unwrap();
    let fanout = EventFanout::new()
        .add_handler(Arc::new(PolicyCacheInvalidator {
            policy: Arc::clone(&policy),
            ledger: Arc::clone(&gateway),
        }))
        .add_handler(Arc::new(PermissionProjector {
            store: Arc::clone(&store) as Arc<dyn MetadataStore>,
        }))
        .add_handler(Arc::new(Notifier { sink: notify_tx }))
        .spawn(events);

    let service = RecordService::new(
        Arc::clone(&store) as Arc<dyn MetadataStore>,
        Arc::clone(&objects),
        Arc::clone(&custody),
        gateway,
        policy,
    );

    Harness {
        service,
        store,
        ledger,
        objects,
        transport,
        custody,
        notifications: notify_rx,
        _fanout: fanout,
        _keys_dir: keys_dir,
    }
}

fn create_request(file: Vec<u8>) -> CreateRecordRequest {
    CreateRecordRequest {
        patient_id: "p1".to_string(),
        creator_id: "d1".to_string(),
        title: "x".to_string(),
        description: String::new(),
        file,
        file_type: FileType::Other,
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within deadline: {what}");
}

#[tokio::test]
async fn create_and_fetch_hello() {
    let h = harness().await;
    let ctx = RequestContext::default();

    let record = h
        .service
        .create_record(create_request(b"hello".to_vec()), &ctx)
        .await
        .unwrap();
    assert_eq!(record.version_number, 1);
    assert_eq!(
        record.content_hash,
        "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
    );
    assert!(record.ledger_tx_id.is_some());

    let read = h
        .service
        .read_record(record.record_id, "d1", &ctx, false)
        .await
        .unwrap();
    assert_eq!(read.plaintext, b"hello");

    // The ledger holds the commitment too.
    let on_ledger = h.ledger.record(&record.record_id.to_string()).unwrap();
    assert_eq!(on_ledger["content_hash"], record.content_hash);
}

#[tokio::test]
async fn permission_gate_grant_then_revoke() {
    let mut h = harness().await;
    let ctx = RequestContext::default();
    let record = h
        .service
        .create_record(create_request(b"hello".to_vec()), &ctx)
        .await
        .unwrap();

    // A stranger is refused, and the refusal is audit-logged.
    let denied = h
        .service
        .read_record(record.record_id, "d2", &ctx, false)
        .await
        .unwrap_err();
    assert_eq!(denied.kind, ErrorKind::Forbidden);
    let audit = h.store.recent_audit(10).await.unwrap();
    assert!(audit.iter().any(|e| e.action == "record.read.denied"));

    h.service
        .grant_access(
            record.record_id,
            "d1",
            "d2",
            PermissionAction::Read,
            None,
            &ctx,
        )
        .await
        .unwrap();

    // Once the AccessGranted event lands, the read succeeds and the local
    // permission row exists.
    let service = Arc::clone(&h.service);
    eventually("grant becomes visible", || {
        let service = Arc::clone(&service);
        let ctx = ctx.clone();
        async move {
            service
                .read_record(record.record_id, "d2", &ctx, false)
                .await
                .is_ok()
        }
    })
    .await;
    let projected = h
        .store
        .effective_permission(record.record_id, "d2", PermissionAction::Read)
        .await
        .unwrap();
    assert!(projected.is_some());

    // The grantee was notified.
    let saw_grant_notice = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(notification) = h.notifications.recv().await {
            if notification.user_id == "d2" && notification.title == "Access granted" {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(saw_grant_notice);

    // Revocation closes the gate again within one propagation interval.
    h.service
        .revoke_access(record.record_id, "d1", "d2", &ctx)
        .await
        .unwrap();
    let service = Arc::clone(&h.service);
    eventually("revocation takes effect", || {
        let service = Arc::clone(&service);
        let ctx = ctx.clone();
        async move {
            matches!(
                service.read_record(record.record_id, "d2", &ctx, false).await,
                Err(e) if e.kind == ErrorKind::Forbidden
            )
        }
    })
    .await;
}

#[tokio::test]
async fn chunk_boundary_roundtrip() {
    let h = harness().await;
    let ctx = RequestContext::default();
    let payload: Vec<u8> = (0..(2 * CHUNK_SIZE + 1)).map(|i| (i % 239) as u8).collect();

    let record = h
        .service
        .create_record(create_request(payload.clone()), &ctx)
        .await
        .unwrap();
    let metadata = h.objects.get_metadata(&record.primary_cid).await.unwrap();
    assert_eq!(metadata.chunk_count, 3);
    assert_eq!(
        h.transport.block_len(metadata.chunk_cids.last().unwrap()),
        Some(1)
    );

    let read = h
        .service
        .read_record(record.record_id, "d1", &ctx, false)
        .await
        .unwrap();
    assert_eq!(read.plaintext, payload);
    assert_eq!(shared_types::sha256_hex(&read.plaintext), record.content_hash);
}

#[tokio::test]
async fn version_chain_grows_and_verifies() {
    let h = harness().await;
    let ctx = RequestContext::default();
    let record = h
        .service
        .create_record(create_request(b"v1 content".to_vec()), &ctx)
        .await
        .unwrap();

    let updated = h
        .service
        .create_version(record.record_id, "d1", b"v2 content".to_vec(), &ctx)
        .await
        .unwrap();
    assert_eq!(updated.version_number, 2);
    assert_ne!(updated.merkle_root, record.merkle_root);

    let read = h
        .service
        .read_record(record.record_id, "d1", &ctx, true)
        .await
        .unwrap();
    assert_eq!(read.plaintext, b"v2 content");
    assert_eq!(read.chain_verified, Some(true));

    assert!(h.service.verify_record(record.record_id, "d1").await.unwrap());

    let versions = h.store.load_versions(record.record_id).await.unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[1].previous_hash, versions[0].hash);
}

#[tokio::test]
async fn archived_record_rejects_writes() {
    let h = harness().await;
    let ctx = RequestContext::default();
    let record = h
        .service
        .create_record(create_request(b"content".to_vec()), &ctx)
        .await
        .unwrap();

    h.service
        .archive_record(record.record_id, "d1", &ctx)
        .await
        .unwrap();

    let err = h
        .service
        .create_version(record.record_id, "d1", b"more".to_vec(), &ctx)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Conflict);

    // Archiving twice is also a conflict: ARCHIVED is terminal.
    let err = h
        .service
        .archive_record(record.record_id, "d1", &ctx)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Conflict);

    // Reads still work.
    assert!(h
        .service
        .read_record(record.record_id, "d1", &ctx, false)
        .await
        .is_ok());
}

#[tokio::test]
async fn ledger_rejection_surfaces_and_compensates() {
    let h = harness().await;
    let ctx = RequestContext::default();
    h.ledger.disable_function("CreateMedicalRecord");
    h.ledger.disable_function("CreateRecord");

    let err = h
        .service
        .create_record(create_request(b"doomed".to_vec()), &ctx)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::LedgerError);

    // No local record was committed.
    assert!(h.store.recent_audit(10).await.unwrap().iter().all(|e| e.action != "record.create"));
}

#[tokio::test]
async fn missing_local_record_reconciles_from_ledger() {
    let h = harness().await;
    let ctx = RequestContext::default();
    let record = h
        .service
        .create_record(create_request(b"durable".to_vec()), &ctx)
        .await
        .unwrap();

    // Simulate a fresh node: empty metadata store, same ledger and objects.
    let fresh_store = Arc::new(MemoryMetadataStore::new());
    let gateway = LedgerGateway::initialize(Arc::clone(&h.ledger) as _, LedgerConfig::for_tests())
        .await
        .unwrap();
    let policy = Arc::new(PolicyEngine::new().with_ledger(Arc::clone(&gateway)));
    policy.install_default_policies().await;

    // Reuse the original custody so the data key still unwraps.
    let rebuilt = RecordService::new(
        Arc::clone(&fresh_store) as Arc<dyn MetadataStore>,
        Arc::clone(&h.objects),
        Arc::clone(&h.custody),
        gateway,
        policy,
    );

    let read = rebuilt
        .read_record(record.record_id, "d1", &ctx, false)
        .await
        .unwrap();
    assert_eq!(read.plaintext, b"durable");
    // The reconcile path committed a local copy.
    assert!(fresh_store.load_record(record.record_id).await.unwrap().is_some());
}
