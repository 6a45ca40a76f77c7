//! Local filesystem key-value store.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::store::KeyValueStore;
use outbox_common::{Error, Result};

/// Filesystem-backed key-value store.
///
/// Each key is stored as one file under the root directory. Writes go to a
/// uniquely named temporary file first, are flushed to disk, and only then
/// renamed into place, so a crash mid-write leaves the previous value intact.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create a new file store with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Invalid path
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        // Create root if it doesn't exist (sync for constructor)
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key to its file, rejecting anything that could escape the root.
    fn key_path(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !valid {
            return Err(Error::InvalidInput(format!("Invalid store key: {:?}", key)));
        }
        Ok(self.root.join(key))
    }

    /// Write `bytes` to `path` and wait until they reach the disk.
    async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = fs::File::create(path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.key_path(key)?;

        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("Failed to read {}: {}", key, e))),
        }
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        let path = self.key_path(key)?;
        let tmp = self.root.join(format!(".{}.{}.tmp", key, Uuid::new_v4()));

        if let Err(e) = Self::write_synced(&tmp, value.as_bytes()).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(Error::Storage(format!("Failed to write {}: {}", key, e)));
        }

        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(Error::Storage(format!("Failed to commit {}: {}", key, e)));
        }

        debug!("Stored {} ({} bytes)", key, value.len());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.key_path(key)?;

        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("Failed to remove {}: {}", key, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_put_get() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path()).unwrap();

        store.put("outbox.test", "hello".to_string()).await.unwrap();
        let value = store.get("outbox.test").await.unwrap();

        assert_eq!(value.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_file_survives_reopen() {
        let temp = TempDir::new().unwrap();

        {
            let store = FileStore::new(temp.path()).unwrap();
            store.put("k", "persisted".to_string()).await.unwrap();
        }

        let store = FileStore::new(temp.path()).unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("persisted"));
    }

    #[tokio::test]
    async fn test_file_missing_and_remove() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path()).unwrap();

        assert!(store.get("absent").await.unwrap().is_none());
        store.remove("absent").await.unwrap();

        store.put("present", "x".to_string()).await.unwrap();
        store.remove("present").await.unwrap();
        assert!(store.get("present").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_rejects_path_keys() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path()).unwrap();

        assert!(store.put("../escape", "x".to_string()).await.is_err());
        assert!(store.put("a/b", "x".to_string()).await.is_err());
        assert!(store.get("").await.is_err());
    }

    #[tokio::test]
    async fn test_file_creates_root() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("nested").join("store");

        let store = FileStore::new(&root).unwrap();
        assert!(store.root().is_dir());
    }

    #[tokio::test]
    async fn test_file_put_leaves_no_temporaries() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path()).unwrap();

        store.put("queue", "[1]".to_string()).await.unwrap();
        store.put("queue", "[1,2]".to_string()).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["queue".to_string()]);
        assert_eq!(
            std::fs::read_to_string(temp.path().join("queue")).unwrap(),
            "[1,2]"
        );
    }
}
