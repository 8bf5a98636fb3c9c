//! Document/object store collaborator
//!
//! Write a buffer, get an opaque id back; read an id, get the buffer and its
//! metadata. The filesystem implementation stores each object next to a JSON
//! sidecar carrying the metadata.

use crate::{BridgeError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

/// Metadata carried with every stored object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
}

/// Result of a successful write
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub id: String,
    pub meta: ObjectMeta,
}

/// Object storage contract
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store a buffer, returning its opaque id and metadata
    async fn write(
        &self,
        buffer: Vec<u8>,
        content_type: &str,
        filename: &str,
    ) -> Result<StoredObject>;

    /// Read an object back by id
    async fn read(&self, id: &str) -> Result<(Vec<u8>, ObjectMeta)>;
}

/// Filesystem-backed object store
///
/// Objects are written as `<dir>/<uuid>` with metadata in `<dir>/<uuid>.meta.json`.
pub struct FsObjectStore {
    dir: PathBuf,
}

impl FsObjectStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn object_path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.meta.json", id))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn write(
        &self,
        buffer: Vec<u8>,
        content_type: &str,
        filename: &str,
    ) -> Result<StoredObject> {
        let id = uuid::Uuid::new_v4().to_string();
        let meta = ObjectMeta {
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            size: buffer.len() as u64,
        };

        tokio::fs::write(self.object_path(&id), &buffer).await?;
        tokio::fs::write(self.meta_path(&id), serde_json::to_vec(&meta)?).await?;

        tracing::debug!(id = %id, filename = %meta.filename, size = meta.size, "Stored object");

        Ok(StoredObject { id, meta })
    }

    async fn read(&self, id: &str) -> Result<(Vec<u8>, ObjectMeta)> {
        let buffer = tokio::fs::read(self.object_path(id))
            .await
            .map_err(|e| BridgeError::ObjectStore(format!("read {}: {}", id, e)))?;
        let meta_bytes = tokio::fs::read(self.meta_path(id))
            .await
            .map_err(|e| BridgeError::ObjectStore(format!("read metadata {}: {}", id, e)))?;
        let meta: ObjectMeta = serde_json::from_slice(&meta_bytes)?;
        Ok((buffer, meta))
    }
}

/// In-memory object store for tests
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, (Vec<u8>, ObjectMeta)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn write(
        &self,
        buffer: Vec<u8>,
        content_type: &str,
        filename: &str,
    ) -> Result<StoredObject> {
        let id = uuid::Uuid::new_v4().to_string();
        let meta = ObjectMeta {
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            size: buffer.len() as u64,
        };
        self.objects
            .lock()
            .await
            .insert(id.clone(), (buffer, meta.clone()));
        Ok(StoredObject { id, meta })
    }

    async fn read(&self, id: &str) -> Result<(Vec<u8>, ObjectMeta)> {
        self.objects
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| BridgeError::ObjectStore(format!("unknown object: {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fs_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path()).unwrap();

        let stored = store
            .write(b"hello".to_vec(), "text/plain", "note.txt")
            .await
            .unwrap();
        assert_eq!(stored.meta.size, 5);

        let (bytes, meta) = store.read(&stored.id).await.unwrap();
        assert_eq!(bytes, b"hello");
        assert_eq!(meta.filename, "note.txt");
        assert_eq!(meta.content_type, "text/plain");
    }

    #[tokio::test]
    async fn test_fs_store_unknown_id() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path()).unwrap();
        assert!(store.read("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryObjectStore::new();
        let stored = store
            .write(vec![1, 2, 3], "application/pdf", "doc.pdf")
            .await
            .unwrap();
        let (bytes, meta) = store.read(&stored.id).await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(meta.filename, "doc.pdf");
    }
}
