// object-store-rs/src/transport.rs
//
// Transport seam for the object store. The client talks to a pool of nodes
// through this trait; production uses the HTTP implementation, tests use the
// in-memory one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use crate::ObjectStoreError;

/// Size and block count of a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectStat {
    pub size: u64,
    pub blocks: u64,
}

/// Per-node object operations plus cluster-level pinning.
#[async_trait]
pub trait ObjectTransport: Send + Sync {
    /// Store a block on `node`, returning its CID.
    async fn add_block(&self, node: &str, data: Vec<u8>) -> Result<String, ObjectStoreError>;

    /// Fetch a block by CID from `node`.
    async fn cat_block(&self, node: &str, cid: &str) -> Result<Vec<u8>, ObjectStoreError>;

    /// Pin a CID locally on `node`.
    async fn pin_add(&self, node: &str, cid: &str) -> Result<(), ObjectStoreError>;

    /// Remove a local pin on `node`.
    async fn pin_rm(&self, node: &str, cid: &str) -> Result<(), ObjectStoreError>;

    /// Object stat by CID.
    async fn stat(&self, node: &str, cid: &str) -> Result<ObjectStat, ObjectStoreError>;

    /// Request cluster replication pinning for a CID.
    async fn cluster_pin(
        &self,
        cid: &str,
        replication_min: u32,
        replication_max: u32,
    ) -> Result<(), ObjectStoreError>;

    /// Drop the cluster pin for a CID.
    async fn cluster_unpin(&self, cid: &str) -> Result<(), ObjectStoreError>;

    /// Cheap liveness check used by the background probe.
    async fn healthcheck(&self, node: &str) -> bool;
}

/// Content-addressed in-memory transport for tests and LIGHT_MODE smoke
/// runs. Nodes listed in `failing` reject every call, which is how failover
/// tests simulate a dead endpoint.
#[derive(Default)]
pub struct MemoryObjectTransport {
    blocks: DashMap<String, Vec<u8>>,
    pins: DashSet<String>,
    cluster_pins: DashMap<String, (u32, u32)>,
    failing: DashSet<String>,
    pub add_calls: AtomicUsize,
    pub cat_calls: AtomicUsize,
}

impl MemoryObjectTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_node(&self, node: &str) {
        self.failing.insert(node.to_string());
    }

    pub fn recover_node(&self, node: &str) {
        self.failing.remove(node);
    }

    pub fn is_pinned(&self, cid: &str) -> bool {
        self.pins.contains(cid)
    }

    pub fn cluster_pin_of(&self, cid: &str) -> Option<(u32, u32)> {
        self.cluster_pins.get(cid).map(|e| *e.value())
    }

    /// Corrupt a stored block in place; integrity tests use this.
    pub fn tamper(&self, cid: &str) {
        if let Some(mut block) = self.blocks.get_mut(cid) {
            if let Some(first) = block.first_mut() {
                *first ^= 0xff;
            }
        }
    }

    pub fn block_len(&self, cid: &str) -> Option<usize> {
        self.blocks.get(cid).map(|b| b.len())
    }

    fn check_node(&self, node: &str) -> Result<(), ObjectStoreError> {
        if self.failing.contains(node) {
            return Err(ObjectStoreError::NodeUnavailable(node.to_string()));
        }
        Ok(())
    }

    fn cid_of(data: &[u8]) -> String {
        format!("mem{}", shared_types::sha256_hex(data))
    }
}

#[async_trait]
impl ObjectTransport for MemoryObjectTransport {
    async fn add_block(&self, node: &str, data: Vec<u8>) -> Result<String, ObjectStoreError> {
        self.check_node(node)?;
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        let cid = Self::cid_of(&data);
        self.blocks.insert(cid.clone(), data);
        Ok(cid)
    }

    async fn cat_block(&self, node: &str, cid: &str) -> Result<Vec<u8>, ObjectStoreError> {
        self.check_node(node)?;
        self.cat_calls.fetch_add(1, Ordering::SeqCst);
        self.blocks
            .get(cid)
            .map(|b| b.value().clone())
            .ok_or_else(|| ObjectStoreError::CidNotFound(cid.to_string()))
    }

    async fn pin_add(&self, node: &str, cid: &str) -> Result<(), ObjectStoreError> {
        self.check_node(node)?;
        self.pins.insert(cid.to_string());
        Ok(())
    }

    async fn pin_rm(&self, node: &str, cid: &str) -> Result<(), ObjectStoreError> {
        self.check_node(node)?;
        self.pins.remove(cid);
        Ok(())
    }

    async fn stat(&self, node: &str, cid: &str) -> Result<ObjectStat, ObjectStoreError> {
        self.check_node(node)?;
        self.blocks
            .get(cid)
            .map(|b| ObjectStat {
                size: b.len() as u64,
                blocks: 1,
            })
            .ok_or_else(|| ObjectStoreError::CidNotFound(cid.to_string()))
    }

    async fn cluster_pin(
        &self,
        cid: &str,
        replication_min: u32,
        replication_max: u32,
    ) -> Result<(), ObjectStoreError> {
        self.cluster_pins
            .insert(cid.to_string(), (replication_min, replication_max));
        Ok(())
    }

    async fn cluster_unpin(&self, cid: &str) -> Result<(), ObjectStoreError> {
        self.cluster_pins.remove(cid);
        self.pins.remove(cid);
        Ok(())
    }

    async fn healthcheck(&self, node: &str) -> bool {
        !self.failing.contains(node)
    }
}
