// key-custody-rs/src/store.rs
//
// On-disk persistence for wrapped key material: one JSON document per key
// under KEY_STORE_PATH. The in-memory index is rebuilt from this directory
// at startup.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use shared_types::DataKeyMetadata;
use tracing::warn;

use crate::wrap::WrapEnvelope;
use crate::KeyCustodyError;

/// A key as persisted: public metadata plus the wrapped material. A revoked
/// key keeps its metadata but loses its envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredKey {
    pub metadata: DataKeyMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<WrapEnvelope>,
    /// SEC1-compressed public key, hex; present only on asymmetric keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

pub struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key_id: &str) -> PathBuf {
        self.dir.join(format!("{key_id}.json"))
    }

    /// Scan the store directory, skipping unreadable entries with a warning.
    pub fn load_all(&self) -> Result<Vec<StoredKey>, KeyCustodyError> {
        std::fs::create_dir_all(&self.dir)?;
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(KeyCustodyError::from)
                .and_then(|raw| {
                    serde_json::from_str::<StoredKey>(&raw).map_err(|e| {
                        KeyCustodyError::WrapFormatInvalid(format!(
                            "unparseable key file {}: {e}",
                            path.display()
                        ))
                    })
                }) {
                Ok(key) => keys.push(key),
                Err(e) => warn!("skipping key file {}: {}", path.display(), e),
            }
        }
        Ok(keys)
    }

    pub async fn save(&self, key: &StoredKey) -> Result<(), KeyCustodyError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let raw = serde_json::to_vec_pretty(key)
            .map_err(|e| KeyCustodyError::Crypto(format!("serialize key: {e}")))?;
        tokio::fs::write(self.path_for(&key.metadata.key_id), raw).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shared_types::KeyType;

    fn key(id: &str) -> StoredKey {
        StoredKey {
            metadata: DataKeyMetadata {
                key_id: id.to_string(),
                owner: "d1".into(),
                purpose: "data-encryption".into(),
                algorithm: "AES-256-GCM".into(),
                key_type: KeyType::Symmetric,
                created_at: Utc::now(),
                expires_at: None,
                is_active: true,
            },
            envelope: None,
            public_key: None,
        }
    }

    #[tokio::test]
    async fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        store.save(&key("k-1")).await.unwrap();
        store.save(&key("k-2")).await.unwrap();
        // Garbage file is skipped, not fatal.
        std::fs::write(dir.path().join("junk.json"), b"{not json").unwrap();

        let loaded = store.load_all().unwrap();
        let mut ids: Vec<_> = loaded.iter().map(|k| k.metadata.key_id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["k-1", "k-2"]);
    }
}
