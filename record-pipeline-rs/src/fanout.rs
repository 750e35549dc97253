// record-pipeline-rs/src/fanout.rs
//
// Ledger event fan-out.
//
// Normalized chaincode events arrive on a typed channel from the gateway
// and are dispatched to independent subscribers. Handlers are isolated: each
// runs under its own timeout, and a failing handler never stops delivery to
// the others. All handlers are idempotent; the ledger replays events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ledger_gateway::{LedgerEvent, LedgerEventKind, LedgerGateway};
use metadata_store::MetadataStore;
use policy_engine::PolicyEngine;
use shared_types::config::env_secs;
use shared_types::{Permission, PermissionAction};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One fan-out subscriber.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;
    async fn handle(&self, event: &LedgerEvent) -> anyhow::Result<()>;
}

pub struct EventFanout {
    handlers: Vec<Arc<dyn EventHandler>>,
    handler_timeout: Duration,
}

impl EventFanout {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            handler_timeout: env_secs("EVENT_HANDLER_TIMEOUT_SECS", 5),
        }
    }

    pub fn add_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Dispatch one event to every handler, isolating failures.
    pub async fn dispatch(&self, event: &LedgerEvent) {
        for handler in &self.handlers {
            match tokio::time::timeout(self.handler_timeout, handler.handle(event)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(handler = handler.name(), error = %e, "event handler failed")
                }
                Err(_) => {
                    warn!(handler = handler.name(), "event handler timed out")
                }
            }
        }
    }

    /// Consume the gateway's event stream until it closes.
    pub fn spawn(self, mut events: mpsc::Receiver<LedgerEvent>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                debug!(kind = ?event.kind, record = ?event.record_id, "dispatching ledger event");
                self.dispatch(&event).await;
            }
            info!("ledger event stream closed; fan-out stopping");
        })
    }
}

impl Default for EventFanout {
    fn default() -> Self {
        Self::new()
    }
}

/// Drops cached access decisions for the affected record/user so grants and
/// revocations take effect without waiting out the TTL.
pub struct PolicyCacheInvalidator {
    pub policy: Arc<PolicyEngine>,
    pub ledger: Arc<LedgerGateway>,
}

#[async_trait]
impl EventHandler for PolicyCacheInvalidator {
    fn name(&self) -> &'static str {
        "policy-cache-invalidator"
    }

    async fn handle(&self, event: &LedgerEvent) -> anyhow::Result<()> {
        let Some(record_id) = event.record_id.as_deref() else {
            return Ok(());
        };
        self.policy.invalidate(record_id, event.grantee_id.as_deref());
        self.ledger.invalidate_access_cache(record_id);
        Ok(())
    }
}

/// Maintains the denormalized permission view from grant/revoke events.
/// Upserts are keyed by (record_id, grantee_id, action), so replays are
/// harmless.
pub struct PermissionProjector {
    pub store: Arc<dyn MetadataStore>,
}

#[async_trait]
impl EventHandler for PermissionProjector {
    fn name(&self) -> &'static str {
        "permission-projector"
    }

    async fn handle(&self, event: &LedgerEvent) -> anyhow::Result<()> {
        let (Some(record_id), Some(grantee_id)) =
            (event.record_id.as_deref(), event.grantee_id.as_deref())
        else {
            return Ok(());
        };
        let record_id: Uuid = match record_id.parse() {
            Ok(id) => id,
            Err(_) => {
                warn!(record = record_id, "event carries a non-uuid record id");
                return Ok(());
            }
        };
        match event.kind {
            LedgerEventKind::AccessGranted => {
                let action = event
                    .action
                    .as_deref()
                    .and_then(PermissionAction::parse)
                    .unwrap_or(PermissionAction::Read);
                self.store
                    .upsert_permission(&Permission {
                        record_id,
                        grantee_id: grantee_id.to_string(),
                        action,
                        granted_by: event.creator_id.clone().unwrap_or_else(|| "ledger".into()),
                        granted_at: Utc::now(),
                        expires_at: None,
                        is_active: true,
                    })
                    .await?;
            }
            LedgerEventKind::AccessRevoked => {
                self.store
                    .deactivate_permissions(record_id, grantee_id)
                    .await?;
            }
            LedgerEventKind::RecordCreated => {}
        }
        Ok(())
    }
}

/// A user-facing notification produced by the fan-out. Delivery transport
/// (websocket, mail) is an external collaborator; this crate only emits.
#[derive(Debug, Clone)]
pub struct UserNotification {
    pub user_id: String,
    pub title: String,
    pub body: String,
    pub record_id: Option<String>,
}

pub struct Notifier {
    pub sink: mpsc::Sender<UserNotification>,
}

#[async_trait]
impl EventHandler for Notifier {
    fn name(&self) -> &'static str {
        "notifier"
    }

    async fn handle(&self, event: &LedgerEvent) -> anyhow::Result<()> {
        let notification = match event.kind {
            LedgerEventKind::RecordCreated => event.patient_id.as_ref().map(|patient| {
                UserNotification {
                    user_id: patient.clone(),
                    title: "New medical record".to_string(),
                    body: "A record was added to your history".to_string(),
                    record_id: event.record_id.clone(),
                }
            }),
            LedgerEventKind::AccessGranted => event.grantee_id.as_ref().map(|grantee| {
                UserNotification {
                    user_id: grantee.clone(),
                    title: "Access granted".to_string(),
                    body: format!(
                        "You were granted {} access",
                        event.action.as_deref().unwrap_or("READ")
                    ),
                    record_id: event.record_id.clone(),
                }
            }),
            LedgerEventKind::AccessRevoked => event.grantee_id.as_ref().map(|grantee| {
                UserNotification {
                    user_id: grantee.clone(),
                    title: "Access revoked".to_string(),
                    body: "Your access to a record was revoked".to_string(),
                    record_id: event.record_id.clone(),
                }
            }),
        };
        if let Some(notification) = notification {
            info!(user = %notification.user_id, title = %notification.title, "notification queued");
            // A full sink is a slow consumer problem, not a delivery failure.
            let _ = self.sink.try_send(notification);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metadata_store::MemoryMetadataStore;
    use serde_json::json;

    fn event(kind: LedgerEventKind, record_id: Uuid, grantee: &str) -> LedgerEvent {
        LedgerEvent {
            kind,
            record_id: Some(record_id.to_string()),
            patient_id: Some("p1".to_string()),
            creator_id: Some("d1".to_string()),
            grantee_id: Some(grantee.to_string()),
            ipfs_cid: None,
            action: Some("READ".to_string()),
            tx_id: "tx-1".to_string(),
            raw: json!({}),
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl EventHandler for FailingHandler {
        fn name(&self) -> &'static str {
            "failing"
        }
        async fn handle(&self, _event: &LedgerEvent) -> anyhow::Result<()> {
            anyhow::bail!("always fails")
        }
    }

    #[tokio::test]
    async fn projector_applies_grant_and_revoke_idempotently() {
        let store = Arc::new(MemoryMetadataStore::new());
        let projector = PermissionProjector {
            store: Arc::clone(&store) as Arc<dyn MetadataStore>,
        };
        let record_id = Uuid::new_v4();
        let grant = event(LedgerEventKind::AccessGranted, record_id, "d2");

        projector.handle(&grant).await.unwrap();
        projector.handle(&grant).await.unwrap();
        assert!(store
            .effective_permission(record_id, "d2", PermissionAction::Read)
            .await
            .unwrap()
            .is_some());

        let revoke = event(LedgerEventKind::AccessRevoked, record_id, "d2");
        projector.handle(&revoke).await.unwrap();
        // Revoking again is a no-op.
        projector.handle(&revoke).await.unwrap();
        assert!(store
            .effective_permission(record_id, "d2", PermissionAction::Read)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_others() {
        let store = Arc::new(MemoryMetadataStore::new());
        let record_id = Uuid::new_v4();
        let fanout = EventFanout::new()
            .add_handler(Arc::new(FailingHandler))
            .add_handler(Arc::new(PermissionProjector {
                store: Arc::clone(&store) as Arc<dyn MetadataStore>,
            }));

        fanout
            .dispatch(&event(LedgerEventKind::AccessGranted, record_id, "d2"))
            .await;
        assert!(store
            .effective_permission(record_id, "d2", PermissionAction::Read)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn notifier_targets_the_right_user() {
        let (tx, mut rx) = mpsc::channel(8);
        let notifier = Notifier { sink: tx };
        let record_id = Uuid::new_v4();
        notifier
            .handle(&event(LedgerEventKind::AccessGranted, record_id, "d2"))
            .await
            .unwrap();
        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.user_id, "d2");

        notifier
            .handle(&event(LedgerEventKind::RecordCreated, record_id, "d2"))
            .await
            .unwrap();
        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.user_id, "p1");
    }
}
