//! Key-value store subsystem.
//!
//! # Responsibilities
//! - Persistent tier of the protocol cache (`proto:{host}:{port|default}`)
//! - Source of remote list overrides (`config:*` keys)
//!
//! # Design Decisions
//! - Values are opaque strings; callers own the encoding (JSON)
//! - Expiry is enforced on read, expired entries behave like missing ones
//! - Callers treat every error as a miss, so a broken store never fails a request

pub mod file;
pub mod memory;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::schema::{StoreBackend, StoreConfig};

pub use file::FileStore;
pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("store data is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store operation timed out")]
    Timeout,
}

/// Asynchronous string key-value store with optional per-entry expiry.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;
}

/// A stored value and its absolute expiry (unix milliseconds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredValue {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
}

impl StoredValue {
    pub fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at_ms: ttl.map(|ttl| now_ms().saturating_add(ttl.as_millis() as u64)),
        }
    }

    pub fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at_ms.map_or(true, |at| at > now_ms)
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Open the configured backend. `StoreBackend::None` yields no store.
pub fn open_store(config: &StoreConfig) -> Result<Option<Arc<dyn KvStore>>, StoreError> {
    match config.backend {
        StoreBackend::Memory => Ok(Some(Arc::new(MemoryStore::new()))),
        StoreBackend::File => Ok(Some(Arc::new(FileStore::open(&config.path)?))),
        StoreBackend::None => Ok(None),
    }
}
