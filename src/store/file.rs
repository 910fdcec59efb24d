//! JSON file-backed key-value store.
//!
//! The whole map is loaded at startup and written back after every `put`
//! (write to a sibling temp file, then rename). Expired entries are dropped
//! on load and skipped on read.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

use super::{now_ms, KvStore, StoreError, StoredValue};

#[derive(Clone)]
pub struct FileStore {
    inner: Arc<DashMap<String, StoredValue>>,
    path: PathBuf,
    // Serializes file writes so a slow save cannot overwrite a newer one.
    write_lock: Arc<Mutex<()>>,
}

impl FileStore {
    /// Open the store at `path`, loading existing entries if the file exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let inner = DashMap::new();

        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            let map: HashMap<String, StoredValue> = serde_json::from_reader(reader)?;
            let now = now_ms();
            for (k, v) in map.into_iter().filter(|(_, v)| v.is_live(now)) {
                inner.insert(k, v);
            }
            tracing::info!(path = %path.display(), entries = inner.len(), "loaded store file");
        }

        Ok(Self {
            inner: Arc::new(inner),
            path,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    async fn save(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let now = now_ms();
        let map: HashMap<String, StoredValue> = self
            .inner
            .iter()
            .filter(|r| r.value().is_live(now))
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        let bytes = serde_json::to_vec(&map)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        tracing::debug!(path = %self.path.display(), entries = map.len(), "saved store file");
        Ok(())
    }
}

#[async_trait]
impl KvStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = now_ms();
        Ok(self
            .inner
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.inner
            .insert(key.to_string(), StoredValue::new(value, ttl));
        self.save().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = FileStore::open(&path).unwrap();
        assert!(store.is_empty());
        store
            .put("proto:media.example.org:8096", r#"{"proto":"http"}"#, Some(Duration::from_secs(3600)))
            .await
            .unwrap();
        store
            .put("config:blocked_upstreams", r#"["evil.example"]"#, None)
            .await
            .unwrap();

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(
            reopened.get("proto:media.example.org:8096").await.unwrap().as_deref(),
            Some(r#"{"proto":"http"}"#)
        );
        assert_eq!(
            reopened.get("config:blocked_upstreams").await.unwrap().as_deref(),
            Some(r#"["evil.example"]"#)
        );
    }

    #[tokio::test]
    async fn test_expired_entries_dropped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(
            &path,
            r#"{"old":{"value":"x","expires_at_ms":1},"keep":{"value":"y"}}"#,
        )
        .unwrap();

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("old").await.unwrap(), None);
        assert_eq!(store.get("keep").await.unwrap().as_deref(), Some("y"));
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            FileStore::open(&path),
            Err(StoreError::Serialization(_))
        ));
    }
}
