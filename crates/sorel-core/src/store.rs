//! Key-value blob storage for metadata snapshots
//!
//! The metadata engine persists one blob per device type. Two backends are
//! provided: an in-memory map and a directory of `<key>.json` files.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

/// Overwrite-style key-value store. Writes to one key are serialized by the caller.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read a blob, `None` if absent
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Create or replace a blob
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Remove a blob; removing a missing key is not an error
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Every stored key
    async fn keys(&self) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.blobs
            .write()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.blobs.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self.blobs.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

/// Stores each blob as `<dir>/<key>.json`
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    dir: PathBuf,
}

const EXTENSION: &str = "json";

impl FileBlobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            && !key.starts_with('.');
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{}.{}", key, EXTENSION)))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        // Write to a temp file first so a crash never leaves a truncated blob
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), bytes = value.len(), "Stored blob");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryBlobStore::new();
        assert_eq!(store.get("a").await.unwrap(), None);

        store.put("a", b"one").await.unwrap();
        store.put("a", b"two").await.unwrap();
        store.put("b", b"three").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.keys().await.unwrap(), vec!["a", "b"]);

        store.delete("a").await.unwrap();
        store.delete("a").await.unwrap();
        assert_eq!(store.keys().await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_file_store() {
        let temp = TempDir::new().unwrap();
        let store = FileBlobStore::new(temp.path().join("meta"));

        assert!(store.keys().await.unwrap().is_empty());
        assert_eq!(store.get("meta_5_7").await.unwrap(), None);

        store.put("meta_5_7", b"{}").await.unwrap();
        assert!(temp.path().join("meta").join("meta_5_7.json").exists());
        assert_eq!(store.get("meta_5_7").await.unwrap(), Some(b"{}".to_vec()));

        std::fs::write(temp.path().join("meta").join("notes.txt"), "x").unwrap();
        assert_eq!(store.keys().await.unwrap(), vec!["meta_5_7"]);

        store.delete("meta_5_7").await.unwrap();
        store.delete("meta_5_7").await.unwrap();
        assert_eq!(store.get("meta_5_7").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_keys() {
        let temp = TempDir::new().unwrap();
        let store = FileBlobStore::new(temp.path());
        assert!(matches!(
            store.put("../escape", b"x").await,
            Err(StoreError::InvalidKey(_))
        ));
        assert!(matches!(store.get("").await, Err(StoreError::InvalidKey(_))));
    }
}
