//! File-backed keystore, one directory per node

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tss_dispatcher::{Keystore, KeystoreError};

pub struct FileKeystore {
    root: PathBuf,
}

impl FileKeystore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `key/main/3` is stored as `key.main.3.json`
    fn path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", key.replace('/', ".")))
    }
}

#[async_trait]
impl Keystore for FileKeystore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, KeystoreError> {
        match tokio::fs::read(self.path(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(KeystoreError::NotFound(key.into())),
            Err(e) => Err(KeystoreError::Backend(e.to_string())),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KeystoreError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| KeystoreError::Backend(e.to_string()))?;
        tokio::fs::write(self.path(key), value)
            .await
            .map_err(|e| KeystoreError::Backend(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_on_disk() {
        let root = std::env::temp_dir().join(format!("tss-sim-{}", uuid::Uuid::new_v4()));
        let store = FileKeystore::new(&root);

        assert!(matches!(
            store.get("key/main/1").await,
            Err(KeystoreError::NotFound(_))
        ));

        store.put("key/main/1", b"share".to_vec()).await.unwrap();
        assert_eq!(store.get("key/main/1").await.unwrap(), b"share");
        assert!(root.join("key.main.1.json").exists());

        std::fs::remove_dir_all(&root).unwrap();
    }
}
