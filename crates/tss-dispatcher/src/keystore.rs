//! Key material storage boundary

use crate::{DispatchError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tss_engine::LocalSaveData;

#[derive(Debug, Clone, Error)]
pub enum KeystoreError {
    #[error("Key not found: {0}")]
    NotFound(String),
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Composite key under which the share for `(key_id, epoch)` is stored
pub fn key_path(key_id: &str, epoch: u64) -> String {
    format!("key/{key_id}/{epoch}")
}

/// Persistent store for serialized key shares
#[async_trait]
pub trait Keystore: Send + Sync {
    async fn get(&self, key: &str) -> std::result::Result<Vec<u8>, KeystoreError>;

    async fn put(&self, key: &str, value: Vec<u8>) -> std::result::Result<(), KeystoreError>;
}

/// In-memory keystore
#[derive(Default)]
pub struct MemoryKeystore {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryKeystore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Keystore for MemoryKeystore {
    async fn get(&self, key: &str) -> std::result::Result<Vec<u8>, KeystoreError> {
        self.entries
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| KeystoreError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> std::result::Result<(), KeystoreError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }
}

/// Load and decode the share stored for `(key_id, epoch)`
pub(crate) async fn load_save_data(
    keystore: &dyn Keystore,
    key_id: &str,
    epoch: u64,
) -> Result<LocalSaveData> {
    let bytes = match keystore.get(&key_path(key_id, epoch)).await {
        Ok(bytes) => bytes,
        Err(KeystoreError::NotFound(_)) => {
            return Err(DispatchError::KeyNotFound {
                key_id: key_id.to_string(),
                epoch,
            })
        }
        Err(e) => return Err(e.into()),
    };
    let save: LocalSaveData = serde_json::from_slice(&bytes)
        .map_err(|e| DispatchError::InvalidConfig(format!("stored key is unreadable: {e}")))?;
    if save.is_empty() {
        return Err(DispatchError::KeyNotFound {
            key_id: key_id.to_string(),
            epoch,
        });
    }
    Ok(save)
}

/// Serialize and store a share under `(key_id, epoch)`
pub(crate) async fn store_save_data(
    keystore: &dyn Keystore,
    key_id: &str,
    epoch: u64,
    save: &LocalSaveData,
) -> Result<()> {
    let bytes = serde_json::to_vec(save)?;
    keystore.put(&key_path(key_id, epoch), bytes).await?;
    Ok(())
}
