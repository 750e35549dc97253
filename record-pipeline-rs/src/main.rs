// record-pipeline-rs/src/main.rs
// Custody service entrypoint: wires key custody, the object store client,
// the ledger gateway, the policy engine and the metadata store into the
// record pipeline, then runs the event fan-out until shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use key_custody::KeyCustody;
use ledger_gateway::{HttpLedgerTransport, InProcessLedger, LedgerConfig, LedgerGateway, LedgerTransport};
use metadata_store::{DbConfig, MemoryMetadataStore, MetadataStore, PgMetadataStore};
use object_store::{ObjectStoreClient, ObjectStoreConfig};
use policy_engine::PolicyEngine;
use record_pipeline::{
    EventFanout, Notifier, PermissionProjector, PolicyCacheInvalidator, RecordService,
};
use shared_types::config::light_mode;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let light = light_mode();
    info!(light_mode = light, "custody service starting");

    // Key custody first: everything downstream needs it.
    let custody = Arc::new(
        KeyCustody::init_from_env()
            .await
            .context("key custody init failed")?,
    );

    // Metadata store: Postgres in production, in-memory in light mode.
    let store: Arc<dyn MetadataStore> = if light {
        Arc::new(MemoryMetadataStore::new())
    } else {
        Arc::new(
            PgMetadataStore::connect(&DbConfig::from_env())
                .await
                .context("metadata store connect failed")?,
        )
    };
    store.initialize().await.context("schema init failed")?;

    // Object store client over the configured node pool.
    let objects = Arc::new(
        ObjectStoreClient::connect(ObjectStoreConfig::from_env())
            .context("object store client init failed")?
            .with_custody(Arc::clone(&custody)),
    );
    let _probe = if light { None } else { Some(objects.start_probe()) };

    // Ledger gateway; light mode runs against the in-process ledger so the
    // service comes up without a network.
    let ledger_config = LedgerConfig::from_env();
    let transport: Arc<dyn LedgerTransport> = if light {
        InProcessLedger::new()
    } else {
        Arc::new(HttpLedgerTransport::new(
            ledger_config.gateway_url.clone(),
            ledger_config.user_id.clone(),
            ledger_config.msp_id.clone(),
            ledger_config.network_timeout,
        )?)
    };
    let ledger = LedgerGateway::initialize(transport, ledger_config)
        .await
        .context("ledger gateway init failed")?;

    let policy = Arc::new(PolicyEngine::new().with_ledger(Arc::clone(&ledger)));
    policy.install_default_policies().await;

    // The HTTP/WS surface in front of the pipeline is an external
    // collaborator; it mounts on this service handle.
    let _service = RecordService::new(
        Arc::clone(&store),
        Arc::clone(&objects),
        Arc::clone(&custody),
        Arc::clone(&ledger),
        Arc::clone(&policy),
    );

    // Event fan-out: cache invalidation, permission projection, notification.
    let (notify_tx, mut notify_rx) = mpsc::channel(256);
    let events = ledger.subscribe_events().await.context("event subscription failed")?;
    let fanout_task = EventFanout::new()
        .add_handler(Arc::new(PolicyCacheInvalidator {
            policy: Arc::clone(&policy),
            ledger: Arc::clone(&ledger),
        }))
        .add_handler(Arc::new(PermissionProjector {
            store: Arc::clone(&store),
        }))
        .add_handler(Arc::new(Notifier { sink: notify_tx }))
        .spawn(events);

    // Notification delivery is an external collaborator; drain and log here.
    let notify_task = tokio::spawn(async move {
        while let Some(notification) = notify_rx.recv().await {
            info!(user = %notification.user_id, title = %notification.title, "notification");
        }
    });

    info!("custody service ready");
    tokio::signal::ctrl_c().await.context("signal handler")?;
    warn!("shutdown requested");

    fanout_task.abort();
    notify_task.abort();
    ledger.close().await;
    info!("custody service stopped");
    Ok(())
}
