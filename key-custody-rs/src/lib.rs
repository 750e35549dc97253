// key-custody-rs/src/lib.rs
//
// Key custody for the record pipeline.
//
// Data keys are 32-byte AES-256-GCM keys wrapped under a KEK derived from
// the process master key (scrypt over a versioned salt). Key material is
// persisted only as wrap envelopes; plaintext keys exist in memory for the
// duration of a call. Signing keys are separate secp256k1 pairs; symmetric
// keys never sign.

pub mod store;
pub mod wrap;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::RngCore;
use shared_types::config::{env_parse, env_path};
use shared_types::{DataKeyMetadata, KeyType};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

pub use store::{KeyStore, StoredKey};
pub use wrap::{derive_kek, WrapEnvelope, CURRENT_SALT_VERSION};

/// Errors produced by key custody.
#[derive(Debug, thiserror::Error)]
pub enum KeyCustodyError {
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("key inactive: {0}")]
    KeyInactive(String),

    #[error("key expired: {0}")]
    KeyExpired(String),

    #[error("wrap format invalid: {0}")]
    WrapFormatInvalid(String),

    #[error("master key missing: {0}")]
    MasterKeyMissing(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<KeyCustodyError> for shared_types::CustodyError {
    fn from(e: KeyCustodyError) -> Self {
        use shared_types::ErrorKind;
        let kind = match &e {
            KeyCustodyError::KeyNotFound(_) => ErrorKind::NotFound,
            KeyCustodyError::Io(_) => ErrorKind::Internal,
            _ => ErrorKind::CryptoError,
        };
        shared_types::CustodyError::with_source(kind, e.to_string(), e)
    }
}

#[derive(Debug, Clone)]
pub struct KeyCustodyConfig {
    pub store_path: std::path::PathBuf,
    pub rotation_interval_days: i64,
    pub max_key_age_days: i64,
}

impl KeyCustodyConfig {
    pub fn from_env() -> Self {
        Self {
            store_path: env_path("KEY_STORE_PATH", "data/keys"),
            rotation_interval_days: env_parse("KEY_ROTATION_INTERVAL_DAYS", 90i64),
            max_key_age_days: env_parse("MAX_KEY_AGE_DAYS", 365i64),
        }
    }
}

/// Process-wide key custody state. Construct once via [`KeyCustody::init`]
/// and share behind an `Arc`; teardown is `Drop`.
pub struct KeyCustody {
    config: KeyCustodyConfig,
    master_key: [u8; 32],
    /// False when the master key was generated at startup rather than
    /// seeded by the operator.
    seeded: bool,
    /// KEK for the current salt version, derived once at init.
    kek: [u8; 32],
    store: KeyStore,
    keys: Arc<RwLock<HashMap<String, StoredKey>>>,
}

impl KeyCustody {
    /// Initialize custody from the environment, rebuilding the key index
    /// from the store directory.
    pub async fn init(config: KeyCustodyConfig) -> Result<Self, KeyCustodyError> {
        let (master_key, seeded) = load_master_key();
        let kek = derive_kek(&master_key, CURRENT_SALT_VERSION)?;
        let store = KeyStore::new(&config.store_path);
        let loaded = store.load_all()?;
        info!(
            keys = loaded.len(),
            store = %config.store_path.display(),
            "key custody initialized"
        );
        let mut index = HashMap::with_capacity(loaded.len());
        for key in loaded {
            index.insert(key.metadata.key_id.clone(), key);
        }
        Ok(Self {
            config,
            master_key,
            seeded,
            kek,
            store,
            keys: Arc::new(RwLock::new(index)),
        })
    }

    pub async fn init_from_env() -> Result<Self, KeyCustodyError> {
        Self::init(KeyCustodyConfig::from_env()).await
    }

    /// Whether the master key came from the operator rather than being
    /// generated at startup.
    pub fn master_key_seeded(&self) -> bool {
        self.seeded
    }

    /// Operator-facing accessor for the persistent master key. Fails while
    /// the process is running on a generated key.
    pub fn export_master_key(&self) -> Result<[u8; 32], KeyCustodyError> {
        if !self.seeded {
            return Err(KeyCustodyError::MasterKeyMissing(
                "MASTER_KEY was not seeded; running on a generated key".to_string(),
            ));
        }
        Ok(self.master_key)
    }

    /// Issue a fresh symmetric data key, returning its id.
    pub async fn issue(
        &self,
        owner: &str,
        purpose: &str,
        expires_in: Option<Duration>,
    ) -> Result<String, KeyCustodyError> {
        let mut dek = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut dek);
        let envelope = wrap::wrap(&self.kek, &dek)?;
        self.persist_new(owner, purpose, expires_in, KeyType::Symmetric, envelope, None)
            .await
    }

    /// Issue a fresh secp256k1 signing pair, returning its id.
    pub async fn issue_signing(
        &self,
        owner: &str,
        purpose: &str,
    ) -> Result<String, KeyCustodyError> {
        let signing = SigningKey::random(&mut rand::rngs::OsRng);
        let public = VerifyingKey::from(&signing);
        let envelope = wrap::wrap(&self.kek, signing.to_bytes().as_slice())?;
        self.persist_new(
            owner,
            purpose,
            None,
            KeyType::Asymmetric,
            envelope,
            Some(hex::encode(public.to_sec1_bytes())),
        )
        .await
    }

    async fn persist_new(
        &self,
        owner: &str,
        purpose: &str,
        expires_in: Option<Duration>,
        key_type: KeyType,
        envelope: WrapEnvelope,
        public_key: Option<String>,
    ) -> Result<String, KeyCustodyError> {
        let now = Utc::now();
        let key_id = format!("key-{}", Uuid::new_v4());
        let stored = StoredKey {
            metadata: DataKeyMetadata {
                key_id: key_id.clone(),
                owner: owner.to_string(),
                purpose: purpose.to_string(),
                algorithm: match key_type {
                    KeyType::Symmetric => "AES-256-GCM".to_string(),
                    KeyType::Asymmetric => "ECDSA-secp256k1".to_string(),
                },
                key_type,
                created_at: now,
                expires_at: expires_in.map(|d| now + d),
                is_active: true,
            },
            envelope: Some(envelope),
            public_key,
        };
        self.store.save(&stored).await?;
        self.keys.write().await.insert(key_id.clone(), stored);
        Ok(key_id)
    }

    /// Public metadata for a key.
    pub async fn metadata(&self, key_id: &str) -> Result<DataKeyMetadata, KeyCustodyError> {
        self.keys
            .read()
            .await
            .get(key_id)
            .map(|k| k.metadata.clone())
            .ok_or_else(|| KeyCustodyError::KeyNotFound(key_id.to_string()))
    }

    /// Unwrap a key for new encryption work. Inactive or expired keys never
    /// produce plaintext here.
    pub async fn unwrap_key(&self, key_id: &str) -> Result<Vec<u8>, KeyCustodyError> {
        self.unwrap_inner(key_id, false).await
    }

    /// Unwrap a key for decrypting existing objects. A rotated (inactive)
    /// key whose material has not been discarded is still accepted; expired
    /// and revoked keys are not.
    pub async fn unwrap_for_decrypt(&self, key_id: &str) -> Result<Vec<u8>, KeyCustodyError> {
        self.unwrap_inner(key_id, true).await
    }

    async fn unwrap_inner(
        &self,
        key_id: &str,
        allow_inactive: bool,
    ) -> Result<Vec<u8>, KeyCustodyError> {
        let keys = self.keys.read().await;
        let stored = keys
            .get(key_id)
            .ok_or_else(|| KeyCustodyError::KeyNotFound(key_id.to_string()))?;
        if stored.metadata.is_expired(Utc::now()) {
            return Err(KeyCustodyError::KeyExpired(key_id.to_string()));
        }
        if !stored.metadata.is_active && !allow_inactive {
            return Err(KeyCustodyError::KeyInactive(key_id.to_string()));
        }
        let envelope = stored.envelope.as_ref().ok_or_else(|| {
            KeyCustodyError::KeyInactive(format!("{key_id}: material discarded"))
        })?;
        self.unwrap_envelope(envelope)
    }

    /// Unwrap using the cached KEK when the envelope was written under the
    /// current salt version; older envelopes pay a fresh derivation.
    fn unwrap_envelope(&self, envelope: &WrapEnvelope) -> Result<Vec<u8>, KeyCustodyError> {
        if envelope.salt_v == CURRENT_SALT_VERSION {
            wrap::unwrap_with_kek(&self.kek, envelope)
        } else {
            wrap::unwrap(&self.master_key, envelope)
        }
    }

    /// Rotate: issue a successor with the same purpose, mark the old key
    /// inactive. Objects wrapped under the old key stay decryptable through
    /// [`Self::unwrap_for_decrypt`] until the material is revoked.
    pub async fn rotate(&self, old_key_id: &str, owner: &str) -> Result<String, KeyCustodyError> {
        let purpose = {
            let keys = self.keys.read().await;
            let old = keys
                .get(old_key_id)
                .ok_or_else(|| KeyCustodyError::KeyNotFound(old_key_id.to_string()))?;
            if old.metadata.key_type != KeyType::Symmetric {
                return Err(KeyCustodyError::Crypto(
                    "only symmetric keys rotate".to_string(),
                ));
            }
            old.metadata.purpose.clone()
        };
        let new_id = self.issue(owner, &purpose, None).await?;
        self.deactivate(old_key_id, false).await?;
        info!(old = old_key_id, new = %new_id, "key rotated");
        Ok(new_id)
    }

    /// Revoke: deactivate and discard the wrapped material.
    pub async fn revoke(&self, key_id: &str) -> Result<(), KeyCustodyError> {
        self.deactivate(key_id, true).await
    }

    async fn deactivate(&self, key_id: &str, discard: bool) -> Result<(), KeyCustodyError> {
        let mut keys = self.keys.write().await;
        let stored = keys
            .get_mut(key_id)
            .ok_or_else(|| KeyCustodyError::KeyNotFound(key_id.to_string()))?;
        stored.metadata.is_active = false;
        if discard {
            stored.envelope = None;
        }
        self.store.save(stored).await?;
        Ok(())
    }

    /// Mark expired keys (and keys past the maximum age) inactive. Returns
    /// the number of keys swept.
    pub async fn sweep_expired(&self) -> Result<usize, KeyCustodyError> {
        let now = Utc::now();
        let max_age = Duration::days(self.config.max_key_age_days);
        let mut swept = 0;
        let mut keys = self.keys.write().await;
        for stored in keys.values_mut() {
            if !stored.metadata.is_active {
                continue;
            }
            if stored.metadata.is_expired(now) || now - stored.metadata.created_at > max_age {
                stored.metadata.is_active = false;
                self.store.save(stored).await?;
                swept += 1;
            }
        }
        if swept > 0 {
            info!(swept, "expiry sweep deactivated keys");
        }
        Ok(swept)
    }

    /// Active symmetric keys older than the rotation interval.
    pub async fn due_for_rotation(&self) -> Vec<String> {
        let now = Utc::now();
        let interval = Duration::days(self.config.rotation_interval_days);
        self.keys
            .read()
            .await
            .values()
            .filter(|k| {
                k.metadata.is_active
                    && k.metadata.key_type == KeyType::Symmetric
                    && now - k.metadata.created_at > interval
            })
            .map(|k| k.metadata.key_id.clone())
            .collect()
    }

    /// Sign with an asymmetric key. Returns the 64-byte compact signature.
    pub async fn sign(&self, key_id: &str, data: &[u8]) -> Result<Vec<u8>, KeyCustodyError> {
        let (key_type, material) = {
            let keys = self.keys.read().await;
            let stored = keys
                .get(key_id)
                .ok_or_else(|| KeyCustodyError::KeyNotFound(key_id.to_string()))?;
            if !stored.metadata.is_usable(Utc::now()) {
                return Err(KeyCustodyError::KeyInactive(key_id.to_string()));
            }
            (stored.metadata.key_type, stored.envelope.clone())
        };
        if key_type != KeyType::Asymmetric {
            return Err(KeyCustodyError::Crypto(
                "symmetric keys never sign".to_string(),
            ));
        }
        let envelope = material.ok_or_else(|| {
            KeyCustodyError::KeyInactive(format!("{key_id}: material discarded"))
        })?;
        let secret = self.unwrap_envelope(&envelope)?;
        let signing = SigningKey::from_slice(&secret)
            .map_err(|e| KeyCustodyError::Crypto(format!("bad signing key: {e}")))?;
        let signature: Signature = signing.sign(data);
        Ok(signature.to_bytes().to_vec())
    }

    /// Verify a compact signature against a stored public key.
    pub async fn verify(
        &self,
        public_key_id: &str,
        data: &[u8],
        signature: &[u8],
    ) -> Result<bool, KeyCustodyError> {
        let public_hex = {
            let keys = self.keys.read().await;
            let stored = keys
                .get(public_key_id)
                .ok_or_else(|| KeyCustodyError::KeyNotFound(public_key_id.to_string()))?;
            stored.public_key.clone().ok_or_else(|| {
                KeyCustodyError::Crypto(format!("{public_key_id} has no public key"))
            })?
        };
        let raw = hex::decode(&public_hex)
            .map_err(|_| KeyCustodyError::Crypto("stored public key is not hex".to_string()))?;
        let verifying = VerifyingKey::from_sec1_bytes(&raw)
            .map_err(|e| KeyCustodyError::Crypto(format!("bad public key: {e}")))?;
        let signature = match Signature::from_slice(signature) {
            Ok(s) => s,
            Err(_) => return Ok(false),
        };
        Ok(verifying.verify(data, &signature).is_ok())
    }
}

fn load_master_key() -> ([u8; 32], bool) {
    match std::env::var("MASTER_KEY") {
        Ok(raw) => match hex::decode(raw.trim()) {
            Ok(bytes) if bytes.len() == 32 => {
                let mut key = [0u8; 32];
                key.copy_from_slice(&bytes);
                (key, true)
            }
            _ => {
                warn!("MASTER_KEY is not 32 hex-encoded bytes; generating an ephemeral master key; operator action required");
                (generate_master_key(), false)
            }
        },
        Err(_) => {
            warn!("MASTER_KEY not set; generating an ephemeral master key; operator action required");
            (generate_master_key(), false)
        }
    }
}

fn generate_master_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &std::path::Path) -> KeyCustodyConfig {
        KeyCustodyConfig {
            store_path: dir.to_path_buf(),
            rotation_interval_days: 90,
            max_key_age_days: 365,
        }
    }

    async fn custody(dir: &std::path::Path) -> KeyCustody {
        KeyCustody::init(config(dir)).await.unwrap()
    }

    #[tokio::test]
    async fn issue_and_unwrap_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let custody = custody(dir.path()).await;
        let key_id = custody.issue("d1", "data-encryption", None).await.unwrap();
        let dek = custody.unwrap_key(&key_id).await.unwrap();
        assert_eq!(dek.len(), 32);
        // A second unwrap returns identical material.
        assert_eq!(custody.unwrap_key(&key_id).await.unwrap(), dek);
    }

    #[tokio::test]
    async fn index_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let key_id = {
            let custody = custody(dir.path()).await;
            custody.issue("d1", "data-encryption", None).await.unwrap()
        };
        let custody = custody(dir.path()).await;
        let meta = custody.metadata(&key_id).await.unwrap();
        assert_eq!(meta.owner, "d1");
        assert!(meta.is_active);
    }

    #[tokio::test]
    async fn expired_key_refuses_unwrap() {
        let dir = tempfile::tempdir().unwrap();
        let custody = custody(dir.path()).await;
        let key_id = custody
            .issue("d1", "data-encryption", Some(Duration::milliseconds(-1)))
            .await
            .unwrap();
        assert!(matches!(
            custody.unwrap_key(&key_id).await,
            Err(KeyCustodyError::KeyExpired(_))
        ));
        assert!(matches!(
            custody.unwrap_for_decrypt(&key_id).await,
            Err(KeyCustodyError::KeyExpired(_))
        ));
        assert_eq!(custody.sweep_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rotation_keeps_old_material_decryptable() {
        let dir = tempfile::tempdir().unwrap();
        let custody = custody(dir.path()).await;
        let old = custody.issue("d1", "data-encryption", None).await.unwrap();
        let old_dek = custody.unwrap_key(&old).await.unwrap();

        let new = custody.rotate(&old, "d1").await.unwrap();
        assert_ne!(old, new);

        // Old key is inactive for new work but still decrypts.
        assert!(matches!(
            custody.unwrap_key(&old).await,
            Err(KeyCustodyError::KeyInactive(_))
        ));
        assert_eq!(custody.unwrap_for_decrypt(&old).await.unwrap(), old_dek);

        // Revocation discards the material for good.
        custody.revoke(&old).await.unwrap();
        assert!(matches!(
            custody.unwrap_for_decrypt(&old).await,
            Err(KeyCustodyError::KeyInactive(_))
        ));
    }

    #[tokio::test]
    async fn sign_verify_roundtrip_and_symmetric_refusal() {
        let dir = tempfile::tempdir().unwrap();
        let custody = custody(dir.path()).await;
        let signer = custody.issue_signing("d1", "record-signing").await.unwrap();
        let sig = custody.sign(&signer, b"payload").await.unwrap();
        assert!(custody.verify(&signer, b"payload", &sig).await.unwrap());
        assert!(!custody.verify(&signer, b"other", &sig).await.unwrap());

        let symmetric = custody.issue("d1", "data-encryption", None).await.unwrap();
        assert!(matches!(
            custody.sign(&symmetric, b"payload").await,
            Err(KeyCustodyError::Crypto(_))
        ));
    }

    #[tokio::test]
    async fn unseeded_master_key_blocks_export_only() {
        let dir = tempfile::tempdir().unwrap();
        // MASTER_KEY is not set in the test environment.
        let custody = custody(dir.path()).await;
        if !custody.master_key_seeded() {
            assert!(matches!(
                custody.export_master_key(),
                Err(KeyCustodyError::MasterKeyMissing(_))
            ));
            // Issuance still works on the generated key.
            assert!(custody.issue("d1", "data-encryption", None).await.is_ok());
        }
    }
}
