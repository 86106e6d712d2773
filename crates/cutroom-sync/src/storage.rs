//! Local durable key-value storage.
//!
//! Holds the persisted session and per-user chat watermarks. Values are kept
//! in one JSON file, rewritten through a temp file and renamed into place so a
//! crash mid-write never leaves a truncated store behind. Nothing expires;
//! entries go away only through [`LocalStorage::remove`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::StorageError;

/// Key of the persisted session blob.
pub const SESSION_KEY: &str = "session";

/// Key of a user's chat read watermark.
pub fn chat_watermark_key(user_id: &str) -> String {
    format!("chat:lastRead:{}", user_id)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StorageFile {
    version: u32,
    entries: BTreeMap<String, Value>,
}

impl Default for StorageFile {
    fn default() -> Self {
        Self {
            version: 1,
            entries: BTreeMap::new(),
        }
    }
}

/// File-backed key-value store. `in_memory` stores skip the file entirely.
#[derive(Debug)]
pub struct LocalStorage {
    path: Option<PathBuf>,
    data: Mutex<StorageFile>,
}

impl LocalStorage {
    /// Open the store at `path`, starting empty if the file doesn't exist.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();

        let data = if fs::try_exists(&path).await? {
            let content = fs::read_to_string(&path).await?;
            match serde_json::from_str(&content) {
                Ok(data) => data,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt storage file, starting empty");
                    StorageFile::default()
                }
            }
        } else {
            StorageFile::default()
        };

        debug!(path = %path.display(), entries = data.entries.len(), "opened local storage");
        Ok(Self {
            path: Some(path),
            data: Mutex::new(data),
        })
    }

    /// Open the store at the platform default location.
    pub async fn open_default() -> Result<Self, StorageError> {
        Self::open(Self::default_path().ok_or(StorageError::NoDataDir)?).await
    }

    /// Default storage path: `<data dir>/cutroom/storage.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("cutroom").join("storage.json"))
    }

    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: Mutex::new(StorageFile::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Read a value. Missing keys and values of the wrong shape read as `None`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let data = self.data.lock().await;
        let value = data.entries.get(key)?.clone();
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key = %key, error = %e, "ignoring unreadable storage entry");
                None
            }
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let value = serde_json::to_value(value)?;
        let mut data = self.data.lock().await;
        data.entries.insert(key.to_string(), value);
        self.save(&data).await
    }

    pub async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut data = self.data.lock().await;
        if data.entries.remove(key).is_none() {
            return Ok(());
        }
        self.save(&data).await
    }

    /// Write the whole store. Callers hold the data lock, so saves never interleave.
    async fn save(&self, data: &StorageFile) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(data)?;

        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;

        // Session blobs are private to the user.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = file.metadata().await?.permissions();
            perms.set_mode(0o600);
            file.set_permissions(perms).await?;
        }

        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use tempfile::tempdir;

    #[tokio::test]
    async fn values_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("storage.json");

        let storage = LocalStorage::open(&path).await.unwrap();
        let ts: DateTime<Utc> = "2026-03-01T10:00:00Z".parse().unwrap();
        storage.set(&chat_watermark_key("u1"), &ts).await.unwrap();
        drop(storage);

        let reopened = LocalStorage::open(&path).await.unwrap();
        let read: Option<DateTime<Utc>> = reopened.get(&chat_watermark_key("u1")).await;
        assert_eq!(read, Some(ts));
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn remove_deletes_only_that_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("storage.json");

        let storage = LocalStorage::open(&path).await.unwrap();
        storage.set(SESSION_KEY, &"blob").await.unwrap();
        storage.set("other", &1).await.unwrap();
        storage.remove(SESSION_KEY).await.unwrap();
        storage.remove("never-set").await.unwrap();

        let reopened = LocalStorage::open(&path).await.unwrap();
        assert_eq!(reopened.get::<String>(SESSION_KEY).await, None);
        assert_eq!(reopened.get::<i32>("other").await, Some(1));
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("storage.json");
        std::fs::write(&path, "{ not json").unwrap();

        let storage = LocalStorage::open(&path).await.unwrap();
        assert_eq!(storage.get::<String>(SESSION_KEY).await, None);
    }

    #[tokio::test]
    async fn in_memory_store_has_no_path() {
        let storage = LocalStorage::in_memory();
        storage.set("k", &"v").await.unwrap();
        assert!(storage.path().is_none());
        assert_eq!(storage.get::<String>("k").await.as_deref(), Some("v"));
    }
}
