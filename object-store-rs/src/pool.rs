// object-store-rs/src/pool.rs
//
// Endpoint pool with health tracking and failover.
//
// Calls round-robin across healthy nodes; a failing call marks its node
// unhealthy and retries on the next healthy one with exponential backoff. A
// background probe re-admits recovered nodes. The health map is mutated only
// under a briefly-held exclusive lock.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::ObjectTransport;
use crate::ObjectStoreError;

const BACKOFF_BASE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy)]
struct NodeHealth {
    healthy: bool,
}

pub struct NodePool {
    nodes: Vec<String>,
    health: RwLock<HashMap<String, NodeHealth>>,
    cursor: AtomicUsize,
    max_retries: usize,
    call_timeout: Duration,
}

impl NodePool {
    pub fn new(nodes: Vec<String>, max_retries: usize, call_timeout: Duration) -> Arc<Self> {
        let health = nodes
            .iter()
            .map(|n| (n.clone(), NodeHealth { healthy: true }))
            .collect();
        Arc::new(Self {
            nodes,
            health: RwLock::new(health),
            cursor: AtomicUsize::new(0),
            max_retries,
            call_timeout,
        })
    }

    pub fn endpoints(&self) -> &[String] {
        &self.nodes
    }

    async fn next_healthy(&self, exclude: &[String]) -> Option<String> {
        let health = self.health.read().await;
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..self.nodes.len() {
            let node = &self.nodes[(start + offset) % self.nodes.len()];
            if exclude.contains(node) {
                continue;
            }
            if health.get(node).map(|h| h.healthy).unwrap_or(false) {
                return Some(node.clone());
            }
        }
        None
    }

    pub async fn mark_unhealthy(&self, node: &str) {
        let mut health = self.health.write().await;
        if let Some(entry) = health.get_mut(node) {
            if entry.healthy {
                warn!(node, "object store node marked unhealthy");
            }
            entry.healthy = false;
        }
    }

    pub async fn mark_healthy(&self, node: &str) {
        let mut health = self.health.write().await;
        if let Some(entry) = health.get_mut(node) {
            if !entry.healthy {
                info!(node, "object store node recovered");
            }
            entry.healthy = true;
        }
    }

    pub async fn healthy_count(&self) -> usize {
        self.health
            .read()
            .await
            .values()
            .filter(|h| h.healthy)
            .count()
    }

    /// Run `op` against up to `max_retries` distinct healthy nodes, backing
    /// off exponentially between attempts. Non-transient errors surface
    /// immediately; node failures rotate to the next endpoint.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, ObjectStoreError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, ObjectStoreError>>,
    {
        let mut tried: Vec<String> = Vec::new();
        let mut last_err = ObjectStoreError::NoHealthyNodes;
        for attempt in 0..self.max_retries {
            let Some(node) = self.next_healthy(&tried).await else {
                return Err(last_err);
            };
            match tokio::time::timeout(self.call_timeout, op(node.clone())).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if e.is_node_failure() => {
                    debug!(node = %node, attempt, error = %e, "node call failed, failing over");
                    self.mark_unhealthy(&node).await;
                    tried.push(node);
                    last_err = e;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    self.mark_unhealthy(&node).await;
                    tried.push(node);
                    last_err = ObjectStoreError::Timeout("object store call timed out".into());
                }
            }
            if attempt + 1 < self.max_retries {
                tokio::time::sleep(BACKOFF_BASE * 2u32.pow(attempt as u32)).await;
            }
        }
        Err(last_err)
    }

    /// Background probe that re-admits recovered nodes. Skipped in light
    /// mode by the caller.
    pub fn spawn_probe(
        self: &Arc<Self>,
        transport: Arc<dyn ObjectTransport>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                for node in pool.nodes.clone() {
                    let alive = transport.healthcheck(&node).await;
                    if alive {
                        pool.mark_healthy(&node).await;
                    } else {
                        pool.mark_unhealthy(&node).await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryObjectTransport;

    fn pool() -> Arc<NodePool> {
        NodePool::new(
            vec!["node-a".into(), "node-b".into(), "node-c".into()],
            3,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn failover_skips_dead_node() {
        let transport = MemoryObjectTransport::new();
        transport.fail_node("node-a");
        let pool = pool();

        let t = Arc::clone(&transport);
        let cid = pool
            .execute(|node| {
                let t = Arc::clone(&t);
                async move { t.add_block(&node, b"payload".to_vec()).await }
            })
            .await
            .unwrap();
        assert!(cid.starts_with("mem"));
        // The dead node got marked unhealthy along the way if it was tried.
        assert!(pool.healthy_count().await >= 2);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_last_error() {
        let transport = MemoryObjectTransport::new();
        for n in ["node-a", "node-b", "node-c"] {
            transport.fail_node(n);
        }
        let pool = pool();
        let t = Arc::clone(&transport);
        let err = pool
            .execute(|node| {
                let t = Arc::clone(&t);
                async move { t.add_block(&node, b"x".to_vec()).await }
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ObjectStoreError::NodeUnavailable(_) | ObjectStoreError::NoHealthyNodes
        ));
        assert_eq!(pool.healthy_count().await, 0);
    }

    #[tokio::test]
    async fn non_transient_error_does_not_rotate() {
        let transport = MemoryObjectTransport::new();
        let pool = pool();
        let t = Arc::clone(&transport);
        let err = pool
            .execute(|node| {
                let t = Arc::clone(&t);
                async move { t.cat_block(&node, "mem-missing").await }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ObjectStoreError::CidNotFound(_)));
        assert_eq!(pool.healthy_count().await, 3);
    }

    #[tokio::test]
    async fn probe_readmits_recovered_node() {
        let transport = MemoryObjectTransport::new();
        let pool = pool();
        pool.mark_unhealthy("node-a").await;
        assert_eq!(pool.healthy_count().await, 2);

        let handle = pool.spawn_probe(transport.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.healthy_count().await, 3);
        handle.abort();
    }
}
