//! Process-local key-value store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{now_ms, KvStore, StoreError, StoredValue};

/// A `DashMap`-backed store. Contents are lost on restart.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<DashMap<String, StoredValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, expired ones included until they are read.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = now_ms();
        if let Some(entry) = self.inner.get(key) {
            if entry.is_live(now) {
                return Ok(Some(entry.value.clone()));
            }
        }
        self.inner.remove_if(key, |_, v| !v.is_live(now));
        Ok(None)
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.inner
            .insert(key.to_string(), StoredValue::new(value, ttl));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_overwrite() {
        let store = MemoryStore::new();
        assert_eq!(store.get("proto:a.com:default").await.unwrap(), None);

        store
            .put("proto:a.com:default", r#"{"proto":"https"}"#, None)
            .await
            .unwrap();
        store
            .put("proto:a.com:default", r#"{"proto":"http"}"#, None)
            .await
            .unwrap();

        assert_eq!(
            store.get("proto:a.com:default").await.unwrap().as_deref(),
            Some(r#"{"proto":"http"}"#)
        );
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_entries_are_misses() {
        let store = MemoryStore::new();
        store
            .put("k", "v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }
}
