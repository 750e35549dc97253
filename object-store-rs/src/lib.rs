// object-store-rs/src/lib.rs
//
// Chunked, encrypted, content-addressed object storage.
//
// Writes split AES-256-GCM ciphertext into fixed 256 KiB chunks, upload them
// with bounded concurrency, then publish a JSON metadata object referencing
// the chunk CIDs. Reads mirror the path and verify the plaintext hash before
// returning. All node traffic goes through the failover pool.

pub mod http;
pub mod pool;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chrono::Utc;
use key_custody::{KeyCustody, KeyCustodyError};
use rand::RngCore;
use shared_types::config::{env_csv, env_opt_string, env_parse, env_secs, env_string};
use shared_types::{sha256_hex, ObjectMetadata, PinState};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

pub use http::HttpObjectTransport;
pub use pool::NodePool;
pub use transport::{MemoryObjectTransport, ObjectStat, ObjectTransport};

/// Fixed ciphertext chunk size.
pub const CHUNK_SIZE: usize = 256 * 1024;

const GCM_TAG_LEN: usize = 16;

/// Errors surfaced by the object store client.
#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("cid not found: {0}")]
    CidNotFound(String),

    #[error("chunk missing: {0}")]
    ChunkMissing(String),

    #[error("auth tag mismatch")]
    AuthTagMismatch,

    #[error("hash mismatch: expected {expected}, computed {computed}")]
    HashMismatch { expected: String, computed: String },

    #[error("no healthy object store nodes")]
    NoHealthyNodes,

    #[error("node unavailable: {0}")]
    NodeUnavailable(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("invalid metadata object: {0}")]
    InvalidMetadata(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error(transparent)]
    KeyCustody(#[from] KeyCustodyError),
}

impl ObjectStoreError {
    /// Whether the failing node should be rotated out and the call retried
    /// on another endpoint.
    pub fn is_node_failure(&self) -> bool {
        matches!(
            self,
            ObjectStoreError::NodeUnavailable(_) | ObjectStoreError::Timeout(_)
        )
    }
}

impl From<ObjectStoreError> for shared_types::CustodyError {
    fn from(e: ObjectStoreError) -> Self {
        use shared_types::ErrorKind;
        let kind = match &e {
            ObjectStoreError::CidNotFound(_) => ErrorKind::NotFound,
            ObjectStoreError::AuthTagMismatch | ObjectStoreError::HashMismatch { .. } => {
                ErrorKind::IntegrityViolation
            }
            ObjectStoreError::ChunkMissing(_)
            | ObjectStoreError::NoHealthyNodes
            | ObjectStoreError::NodeUnavailable(_) => ErrorKind::DependencyUnavailable,
            ObjectStoreError::Timeout(_) => ErrorKind::Timeout,
            ObjectStoreError::Http(_) | ObjectStoreError::InvalidMetadata(_) => {
                ErrorKind::StorageError
            }
            ObjectStoreError::InvalidInput(_) => ErrorKind::InvalidInput,
            ObjectStoreError::Crypto(_) => ErrorKind::CryptoError,
            ObjectStoreError::KeyCustody(_) => ErrorKind::CryptoError,
        };
        shared_types::CustodyError::with_source(kind, e.to_string(), e)
    }
}

#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub nodes: Vec<String>,
    pub cluster_url: Option<String>,
    pub upload_concurrency: usize,
    pub download_concurrency: usize,
    pub replication_min: u32,
    pub replication_max: u32,
    pub max_retries: usize,
    pub call_timeout: Duration,
    pub probe_interval: Duration,
}

impl ObjectStoreConfig {
    pub fn from_env() -> Self {
        let mut nodes = vec![env_string("OBJECT_STORE_URL", "http://127.0.0.1:5001")];
        for node in env_csv("OBJECT_STORE_NODES") {
            if !nodes.contains(&node) {
                nodes.push(node);
            }
        }
        Self {
            nodes,
            cluster_url: env_opt_string("OBJECT_STORE_CLUSTER_URL"),
            upload_concurrency: env_parse("UPLOAD_CONCURRENCY", 4usize),
            download_concurrency: env_parse("DOWNLOAD_CONCURRENCY", 6usize),
            replication_min: env_parse("CLUSTER_REPL_MIN", 3u32),
            replication_max: env_parse("CLUSTER_REPL_MAX", 3u32),
            max_retries: env_parse("OBJECT_STORE_MAX_RETRIES", 3usize),
            call_timeout: env_secs("OBJECT_STORE_TIMEOUT_SECS", 30),
            probe_interval: env_secs("OBJECT_STORE_PROBE_SECS", 30),
        }
    }

    pub fn for_tests(nodes: Vec<String>) -> Self {
        Self {
            nodes,
            cluster_url: None,
            upload_concurrency: 4,
            download_concurrency: 6,
            replication_min: 3,
            replication_max: 3,
            max_retries: 3,
            call_timeout: Duration::from_secs(5),
            probe_interval: Duration::from_secs(30),
        }
    }
}

/// A resolved data key handed to `put`/`get`.
#[derive(Clone)]
pub struct DataKey {
    pub key_id: Option<String>,
    pub material: Vec<u8>,
}

/// Result of a successful `put`.
#[derive(Debug, Clone)]
pub struct PutResult {
    pub primary_cid: String,
    pub content_hash: String,
    pub size: u64,
    /// Set when the client issued a fresh key because the caller brought none.
    pub data_key_id: Option<String>,
}

pub struct ObjectStoreClient {
    transport: Arc<dyn ObjectTransport>,
    pool: Arc<NodePool>,
    config: ObjectStoreConfig,
    custody: Option<Arc<KeyCustody>>,
}

impl ObjectStoreClient {
    pub fn new(transport: Arc<dyn ObjectTransport>, config: ObjectStoreConfig) -> Self {
        let pool = NodePool::new(
            config.nodes.clone(),
            config.max_retries,
            config.call_timeout,
        );
        Self {
            transport,
            pool,
            config,
            custody: None,
        }
    }

    /// Connect over HTTP using environment configuration.
    pub fn connect(config: ObjectStoreConfig) -> Result<Self, ObjectStoreError> {
        let transport = Arc::new(HttpObjectTransport::new(
            config.call_timeout,
            config.cluster_url.clone(),
        )?);
        info!(nodes = config.nodes.len(), "object store client connected");
        Ok(Self::new(transport, config))
    }

    /// Attach key custody so `put` can self-issue data keys.
    pub fn with_custody(mut self, custody: Arc<KeyCustody>) -> Self {
        self.custody = Some(custody);
        self
    }

    /// Start the background node health probe. The caller owns the handle;
    /// skipped entirely in light mode.
    pub fn start_probe(&self) -> tokio::task::JoinHandle<()> {
        self.pool
            .spawn_probe(Arc::clone(&self.transport), self.config.probe_interval)
    }

    /// Encrypt, chunk and store a payload. Returns the metadata CID as the
    /// object's primary address.
    pub async fn put(
        &self,
        plaintext: &[u8],
        file_name: &str,
        mime_type: &str,
        data_key: Option<DataKey>,
    ) -> Result<PutResult, ObjectStoreError> {
        let content_hash = sha256_hex(plaintext);

        let (key, issued_key_id) = match data_key {
            Some(key) => (key, None),
            None => {
                let custody = self.custody.as_ref().ok_or_else(|| {
                    ObjectStoreError::InvalidInput(
                        "no data key supplied and no key custody attached".to_string(),
                    )
                })?;
                let key_id = custody.issue("object-store", "data-encryption", None).await?;
                let material = custody.unwrap_key(&key_id).await?;
                (
                    DataKey {
                        key_id: Some(key_id.clone()),
                        material,
                    },
                    Some(key_id),
                )
            }
        };

        let (iv, ciphertext, tag) = encrypt(&key.material, plaintext)?;
        let chunks: Vec<Vec<u8>> = ciphertext.chunks(CHUNK_SIZE).map(<[u8]>::to_vec).collect();
        let chunk_cids = self.upload_chunks(chunks).await?;

        let metadata = ObjectMetadata {
            file_name: file_name.to_string(),
            content_hash: content_hash.clone(),
            file_size: plaintext.len() as u64,
            mime_type: mime_type.to_string(),
            chunk_count: chunk_cids.len(),
            chunk_cids,
            iv: hex::encode(iv),
            auth_tag: hex::encode(tag),
            encryption_algorithm: "AES-256-GCM".to_string(),
            data_key_id: key.key_id.clone(),
            created_at: Utc::now(),
            pin_state: PinState::Pinned,
            replication_count: self.config.replication_min,
        };
        let metadata_bytes = serde_json::to_vec(&metadata)
            .map_err(|e| ObjectStoreError::InvalidMetadata(e.to_string()))?;

        let primary_cid = self
            .pool
            .execute(|node| {
                let transport = Arc::clone(&self.transport);
                let bytes = metadata_bytes.clone();
                async move { transport.add_block(&node, bytes).await }
            })
            .await?;

        self.pin(
            &primary_cid,
            self.config.replication_min,
            self.config.replication_max,
        )
        .await?;

        debug!(
            cid = %primary_cid,
            chunks = metadata.chunk_count,
            size = metadata.file_size,
            "object stored"
        );
        Ok(PutResult {
            primary_cid,
            content_hash,
            size: plaintext.len() as u64,
            data_key_id: issued_key_id,
        })
    }

    /// Fetch, decrypt and verify an object by its metadata CID.
    pub async fn get(
        &self,
        primary_cid: &str,
        data_key: &[u8],
    ) -> Result<Vec<u8>, ObjectStoreError> {
        let metadata = self.get_metadata(primary_cid).await?;
        let ciphertext = self.download_chunks(&metadata.chunk_cids).await?;

        let iv = hex::decode(&metadata.iv)
            .map_err(|_| ObjectStoreError::InvalidMetadata("iv is not hex".to_string()))?;
        let tag = hex::decode(&metadata.auth_tag)
            .map_err(|_| ObjectStoreError::InvalidMetadata("auth_tag is not hex".to_string()))?;
        let plaintext = decrypt(data_key, &iv, &ciphertext, &tag)?;

        let computed = sha256_hex(&plaintext);
        if computed != metadata.content_hash {
            return Err(ObjectStoreError::HashMismatch {
                expected: metadata.content_hash,
                computed,
            });
        }
        Ok(plaintext)
    }

    /// Fetch and parse the metadata object alone.
    pub async fn get_metadata(
        &self,
        primary_cid: &str,
    ) -> Result<ObjectMetadata, ObjectStoreError> {
        let bytes = self
            .pool
            .execute(|node| {
                let transport = Arc::clone(&self.transport);
                let cid = primary_cid.to_string();
                async move { transport.cat_block(&node, &cid).await }
            })
            .await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ObjectStoreError::InvalidMetadata(e.to_string()))
    }

    /// Pin locally, then request cluster replication.
    pub async fn pin(
        &self,
        cid: &str,
        replication_min: u32,
        replication_max: u32,
    ) -> Result<(), ObjectStoreError> {
        self.pool
            .execute(|node| {
                let transport = Arc::clone(&self.transport);
                let cid = cid.to_string();
                async move { transport.pin_add(&node, &cid).await }
            })
            .await?;
        self.transport
            .cluster_pin(cid, replication_min, replication_max)
            .await
    }

    /// Remove local and cluster pins. Unpinning an unknown CID is a no-op.
    pub async fn unpin(&self, cid: &str) -> Result<(), ObjectStoreError> {
        self.pool
            .execute(|node| {
                let transport = Arc::clone(&self.transport);
                let cid = cid.to_string();
                async move { transport.pin_rm(&node, &cid).await }
            })
            .await?;
        self.transport.cluster_unpin(cid).await
    }

    pub async fn stat(&self, cid: &str) -> Result<ObjectStat, ObjectStoreError> {
        self.pool
            .execute(|node| {
                let transport = Arc::clone(&self.transport);
                let cid = cid.to_string();
                async move { transport.stat(&node, &cid).await }
            })
            .await
    }

    /// Fire-and-forget unpin used by the pipeline's compensation paths.
    pub fn schedule_unpin(&self, cid: String) {
        let pool = Arc::clone(&self.pool);
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            let local = pool
                .execute(|node| {
                    let transport = Arc::clone(&transport);
                    let cid = cid.clone();
                    async move { transport.pin_rm(&node, &cid).await }
                })
                .await;
            if let Err(e) = local {
                error!(cid = %cid, error = %e, "scheduled unpin failed");
                return;
            }
            if let Err(e) = transport.cluster_unpin(&cid).await {
                error!(cid = %cid, error = %e, "scheduled cluster unpin failed");
            }
        });
    }

    async fn upload_chunks(
        &self,
        chunks: Vec<Vec<u8>>,
    ) -> Result<Vec<String>, ObjectStoreError> {
        let total = chunks.len();
        // Index-ordered slots; tasks complete in any order.
        let mut slots: Vec<Option<String>> = vec![None; total];
        let semaphore = Arc::new(Semaphore::new(self.config.upload_concurrency));
        let mut set: JoinSet<(usize, Result<String, ObjectStoreError>)> = JoinSet::new();

        for (index, chunk) in chunks.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let pool = Arc::clone(&self.pool);
            let transport = Arc::clone(&self.transport);
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                let result = pool
                    .execute(|node| {
                        let transport = Arc::clone(&transport);
                        let chunk = chunk.clone();
                        async move { transport.add_block(&node, chunk).await }
                    })
                    .await;
                (index, result)
            });
        }

        let mut failure: Option<ObjectStoreError> = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, Ok(cid))) => slots[index] = Some(cid),
                Ok((_, Err(e))) => failure = Some(e),
                Err(e) => failure = Some(ObjectStoreError::Crypto(format!("upload task: {e}"))),
            }
        }

        if let Some(e) = failure {
            // Partial uploads are garbage; drop their pins in the background.
            for cid in slots.into_iter().flatten() {
                let transport = Arc::clone(&self.transport);
                tokio::spawn(async move {
                    let _ = transport.cluster_unpin(&cid).await;
                });
            }
            return Err(e);
        }
        Ok(slots
            .into_iter()
            .map(|s| s.expect("all chunk slots filled"))
            .collect())
    }

    async fn download_chunks(
        &self,
        chunk_cids: &[String],
    ) -> Result<Vec<u8>, ObjectStoreError> {
        let total = chunk_cids.len();
        let mut slots: Vec<Option<Vec<u8>>> = vec![None; total];
        let semaphore = Arc::new(Semaphore::new(self.config.download_concurrency));
        let mut set: JoinSet<(usize, Result<Vec<u8>, ObjectStoreError>)> = JoinSet::new();

        for (index, cid) in chunk_cids.iter().cloned().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let pool = Arc::clone(&self.pool);
            let transport = Arc::clone(&self.transport);
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                let result = pool
                    .execute(|node| {
                        let transport = Arc::clone(&transport);
                        let cid = cid.clone();
                        async move { transport.cat_block(&node, &cid).await }
                    })
                    .await
                    .map_err(|e| match e {
                        ObjectStoreError::CidNotFound(cid) => ObjectStoreError::ChunkMissing(cid),
                        other => other,
                    });
                (index, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, Ok(bytes))) => slots[index] = Some(bytes),
                Ok((_, Err(e))) => return Err(e),
                Err(e) => {
                    return Err(ObjectStoreError::Crypto(format!("download task: {e}")))
                }
            }
        }

        let mut out = Vec::new();
        for slot in slots {
            out.extend_from_slice(&slot.expect("all chunk slots filled"));
        }
        Ok(out)
    }
}

fn encrypt(
    key: &[u8],
    plaintext: &[u8],
) -> Result<([u8; 12], Vec<u8>, [u8; 16]), ObjectStoreError> {
    if key.len() != 32 {
        return Err(ObjectStoreError::Crypto(format!(
            "data key must be 32 bytes, got {}",
            key.len()
        )));
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut iv = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    let mut sealed = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|e| ObjectStoreError::Crypto(format!("encrypt failed: {e}")))?;
    // aes-gcm appends the tag; keep it in the metadata, not the chunks.
    let split = sealed.len() - GCM_TAG_LEN;
    let mut tag = [0u8; 16];
    tag.copy_from_slice(&sealed[split..]);
    sealed.truncate(split);
    Ok((iv, sealed, tag))
}

fn decrypt(
    key: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
) -> Result<Vec<u8>, ObjectStoreError> {
    if key.len() != 32 {
        return Err(ObjectStoreError::Crypto(format!(
            "data key must be 32 bytes, got {}",
            key.len()
        )));
    }
    if iv.len() != 12 || tag.len() != GCM_TAG_LEN {
        return Err(ObjectStoreError::InvalidMetadata(
            "iv/auth_tag have wrong length".to_string(),
        ));
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut sealed = ciphertext.to_vec();
    sealed.extend_from_slice(tag);
    cipher
        .decrypt(Nonce::from_slice(iv), sealed.as_ref())
        .map_err(|_| ObjectStoreError::AuthTagMismatch)
}
