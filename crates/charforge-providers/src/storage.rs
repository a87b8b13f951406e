//! Object storage for generated images.
//!
//! Objects are written under a fresh uuid key and are immutable once stored.
//! [`FsStorage`] writes to a local directory; [`MemoryStorage`] keeps
//! everything in a map and is used by tests.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Errors raised by object storage.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Writing the object failed.
    #[error("failed to write object '{key}': {message}")]
    WriteFailed {
        /// Object key.
        key: String,
        /// Underlying failure.
        message: String,
    },

    /// Deleting the object failed.
    #[error("failed to delete object '{key}': {message}")]
    DeleteFailed {
        /// Object key.
        key: String,
        /// Underlying failure.
        message: String,
    },

    /// The storage directory could not be prepared.
    #[error("storage directory '{path}' is unusable: {message}\n\nSuggestion: Check the 'storage.dir' setting in charforge.json")]
    Directory {
        /// Storage root.
        path: PathBuf,
        /// Underlying failure.
        message: String,
    },
}

/// Where a stored object ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    /// Storage key.
    pub object_key: String,
    /// URL clients can load the object from.
    pub public_url: String,
}

/// A blob store for image bytes.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Stores `bytes` under a new key.
    async fn put(
        &self,
        bytes: &[u8],
        content_type: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<StoredObject, StorageError>;

    /// Removes an object. Returns `false` if it did not exist.
    async fn delete(&self, object_key: &str) -> Result<bool, StorageError>;
}

/// File extension for a MIME type.
fn extension_for(content_type: &str) -> &'static str {
    match content_type.split(';').next().unwrap_or_default().trim() {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "bin",
    }
}

fn new_key(content_type: &str) -> String {
    format!("{}.{}", Uuid::new_v4(), extension_for(content_type))
}

// ============================================================================
// Filesystem
// ============================================================================

/// Stores objects as files in a directory.
///
/// Metadata is written next to each object as `<key>.meta.json`.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
    public_base_url: Option<String>,
}

impl FsStorage {
    /// Creates a store rooted at `root`, creating the directory if needed.
    pub async fn new(
        root: impl Into<PathBuf>,
        public_base_url: Option<String>,
    ) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| StorageError::Directory {
                path: root.clone(),
                message: e.to_string(),
            })?;
        Ok(Self {
            root,
            public_base_url: public_base_url.map(|u| u.trim_end_matches('/').to_string()),
        })
    }

    /// Returns the storage root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the on-disk path of `object_key`.
    #[must_use]
    pub fn path_of(&self, object_key: &str) -> PathBuf {
        self.root.join(object_key)
    }

    fn public_url(&self, object_key: &str) -> String {
        match &self.public_base_url {
            Some(base) => format!("{base}/{object_key}"),
            None => format!("file://{}", self.path_of(object_key).display()),
        }
    }
}

#[async_trait]
impl ObjectStorage for FsStorage {
    #[instrument(skip(self, bytes, metadata), fields(size = bytes.len()))]
    async fn put(
        &self,
        bytes: &[u8],
        content_type: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<StoredObject, StorageError> {
        let key = new_key(content_type);
        let write_err = |e: std::io::Error| StorageError::WriteFailed {
            key: key.clone(),
            message: e.to_string(),
        };

        tokio::fs::write(self.path_of(&key), bytes)
            .await
            .map_err(write_err)?;

        let mut meta = metadata.clone();
        meta.insert("contentType".to_string(), content_type.to_string());
        let meta_json = serde_json::to_vec_pretty(&meta).map_err(|e| StorageError::WriteFailed {
            key: key.clone(),
            message: e.to_string(),
        })?;
        tokio::fs::write(self.path_of(&format!("{key}.meta.json")), meta_json)
            .await
            .map_err(write_err)?;

        debug!(key = %key, "Stored object");
        Ok(StoredObject {
            public_url: self.public_url(&key),
            object_key: key,
        })
    }

    #[instrument(skip(self))]
    async fn delete(&self, object_key: &str) -> Result<bool, StorageError> {
        let delete_err = |e: std::io::Error| StorageError::DeleteFailed {
            key: object_key.to_string(),
            message: e.to_string(),
        };
        match tokio::fs::remove_file(self.path_of(object_key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(delete_err(e)),
        }
        match tokio::fs::remove_file(self.path_of(&format!("{object_key}.meta.json"))).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(delete_err(e)),
        }
        debug!("Deleted object");
        Ok(true)
    }
}

// ============================================================================
// Memory
// ============================================================================

/// A stored object held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryObject {
    /// Payload.
    pub bytes: Vec<u8>,
    /// MIME type.
    pub content_type: String,
    /// Caller metadata.
    pub metadata: BTreeMap<String, String>,
}

/// An in-memory object store.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, MemoryObject>>,
    fail_writes: bool,
}

impl MemoryStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store whose writes always fail.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            objects: Mutex::default(),
            fail_writes: true,
        }
    }

    /// Returns a copy of the object stored under `key`.
    pub async fn get(&self, key: &str) -> Option<MemoryObject> {
        self.objects.lock().await.get(key).cloned()
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.lock().await.len()
    }

    /// Returns `true` if nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.objects.lock().await.is_empty()
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn put(
        &self,
        bytes: &[u8],
        content_type: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<StoredObject, StorageError> {
        let key = new_key(content_type);
        if self.fail_writes {
            return Err(StorageError::WriteFailed {
                key,
                message: "storage is read-only".to_string(),
            });
        }
        self.objects.lock().await.insert(
            key.clone(),
            MemoryObject {
                bytes: bytes.to_vec(),
                content_type: content_type.to_string(),
                metadata: metadata.clone(),
            },
        );
        Ok(StoredObject {
            public_url: format!("memory://{key}"),
            object_key: key,
        })
    }

    async fn delete(&self, object_key: &str) -> Result<bool, StorageError> {
        Ok(self.objects.lock().await.remove(object_key).is_some())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn metadata() -> BTreeMap<String, String> {
        BTreeMap::from([("imageId".to_string(), "img-1".to_string())])
    }

    #[test]
    fn test_extension_for() {
        assert_eq!(extension_for("image/png"), "png");
        assert_eq!(extension_for("image/jpeg; charset=binary"), "jpg");
        assert_eq!(extension_for("application/octet-stream"), "bin");
    }

    #[tokio::test]
    async fn test_fs_put_and_delete() {
        let dir = TempDir::new().unwrap();
        let storage = FsStorage::new(dir.path().join("images"), None).await.unwrap();

        let stored = storage
            .put(b"png-bytes", "image/png", &metadata())
            .await
            .unwrap();
        assert!(stored.object_key.ends_with(".png"));
        assert!(stored.public_url.starts_with("file://"));

        let on_disk = tokio::fs::read(storage.path_of(&stored.object_key)).await.unwrap();
        assert_eq!(on_disk, b"png-bytes");

        let meta = tokio::fs::read_to_string(storage.path_of(&format!("{}.meta.json", stored.object_key)))
            .await
            .unwrap();
        assert!(meta.contains("img-1"));

        assert!(storage.delete(&stored.object_key).await.unwrap());
        assert!(!storage.delete(&stored.object_key).await.unwrap());
    }

    #[tokio::test]
    async fn test_fs_public_base_url() {
        let dir = TempDir::new().unwrap();
        let storage = FsStorage::new(dir.path(), Some("https://cdn.example.com/img/".to_string()))
            .await
            .unwrap();
        let stored = storage.put(b"x", "image/webp", &metadata()).await.unwrap();
        assert_eq!(
            stored.public_url,
            format!("https://cdn.example.com/img/{}", stored.object_key)
        );
    }

    #[tokio::test]
    async fn test_memory_storage() {
        let storage = MemoryStorage::new();
        let stored = storage.put(b"abc", "image/png", &metadata()).await.unwrap();

        assert_eq!(storage.len().await, 1);
        let object = storage.get(&stored.object_key).await.unwrap();
        assert_eq!(object.bytes, b"abc");
        assert_eq!(object.metadata.get("imageId").map(String::as_str), Some("img-1"));

        assert!(storage.delete(&stored.object_key).await.unwrap());
        assert!(storage.is_empty().await);
    }

    #[tokio::test]
    async fn test_failing_memory_storage() {
        let storage = MemoryStorage::failing();
        let err = storage.put(b"abc", "image/png", &metadata()).await.unwrap_err();
        assert!(matches!(err, StorageError::WriteFailed { .. }));
    }
}
