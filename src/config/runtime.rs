//! Live configuration snapshot.
//!
//! # Data Flow
//! ```text
//! defaults → TOML file (base) → store list overrides
//!     → Snapshot { config, policy }
//!     → ArcSwap (requests load one snapshot at entry)
//!
//! Triggers:
//!     file watcher         → apply_base(new file config) → refresh
//!     every refresh_secs   → refresh (re-read store overrides)
//! ```
//!
//! # Design Decisions
//! - Snapshots are immutable and swapped whole; a request never sees a mix
//! - A non-empty override list replaces the file list; empty or unreadable keys are ignored
//! - Store failures keep the previous overrides out and the base lists in
//! - Refreshes are serialized, so a slow store read never swaps in a snapshot
//!   built from a base that has since been replaced

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::config::schema::{AccessConfig, GatewayConfig};
use crate::observability::metrics;
use crate::security::AccessPolicy;
use crate::store::KvStore;

pub const BLOCKED_UPSTREAMS_KEY: &str = "config:blocked_upstreams";
pub const DIRECT_REDIRECT_DOMAINS_KEY: &str = "config:direct_redirect_domains";
pub const ALLOWED_UPSTREAMS_KEY: &str = "config:allowed_upstreams";
pub const AUTO_PROXY_PATTERNS_KEY: &str = "config:auto_proxy_patterns";

/// The configuration a single request runs against.
#[derive(Debug)]
pub struct Snapshot {
    pub config: GatewayConfig,
    pub policy: AccessPolicy,
}

impl Snapshot {
    pub fn new(config: GatewayConfig) -> Self {
        let policy = AccessPolicy::from_config(&config.access);
        Self { config, policy }
    }
}

pub struct RuntimeConfig {
    base: ArcSwap<GatewayConfig>,
    current: ArcSwap<Snapshot>,
    store: Option<Arc<dyn KvStore>>,
    refresh_lock: Mutex<()>,
}

impl RuntimeConfig {
    /// Start from the base config alone; call `refresh` to pull store overrides.
    pub fn new(base: GatewayConfig, store: Option<Arc<dyn KvStore>>) -> Self {
        let snapshot = Snapshot::new(base.clone());
        Self {
            base: ArcSwap::from_pointee(base),
            current: ArcSwap::from_pointee(snapshot),
            store,
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn load(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Replace the file-level config and rebuild the snapshot.
    pub async fn apply_base(&self, config: GatewayConfig) {
        self.base.store(Arc::new(config));
        self.refresh().await;
        tracing::info!("configuration reloaded");
    }

    /// Re-read store overrides on top of the current base and swap the snapshot.
    pub async fn refresh(&self) {
        let _guard = self.refresh_lock.lock().await;
        let mut config = GatewayConfig::clone(&self.base.load());
        if let Some(store) = &self.store {
            apply_overrides(store.as_ref(), &mut config.access).await;
        }
        self.current.store(Arc::new(Snapshot::new(config)));
    }

    /// Refresh every `remote.refresh_secs` until shutdown.
    pub fn spawn_refresher(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let period = Duration::from_secs(runtime.load().config.remote.refresh_secs.max(1));
                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        runtime.refresh().await;
                        tracing::debug!("store overrides refreshed");
                    }
                    _ = shutdown.recv() => {
                        tracing::debug!("config refresher stopping");
                        break;
                    }
                }
            }
        })
    }
}

async fn apply_overrides(store: &dyn KvStore, access: &mut AccessConfig) {
    let (blocked, direct, allowed, auto_proxy) = tokio::join!(
        read_list(store, BLOCKED_UPSTREAMS_KEY),
        read_list(store, DIRECT_REDIRECT_DOMAINS_KEY),
        read_list(store, ALLOWED_UPSTREAMS_KEY),
        read_list(store, AUTO_PROXY_PATTERNS_KEY),
    );

    if let Some(list) = blocked {
        access.blocked_upstreams = list;
    }
    if let Some(list) = direct {
        access.direct_redirect_domains = list;
    }
    if let Some(list) = allowed {
        access.allowed_upstreams = list;
    }
    if let Some(list) = auto_proxy {
        access.auto_proxy_patterns = list;
    }
}

async fn read_list(store: &dyn KvStore, key: &str) -> Option<Vec<String>> {
    let raw = match store.get(key).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            metrics::record_store_error("get");
            tracing::warn!(key = %key, error = %e, "config override read failed");
            return None;
        }
    };
    match serde_json::from_str::<Vec<String>>(&raw) {
        Ok(list) if !list.is_empty() => Some(list),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "ignoring malformed config override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::store::{MemoryStore, StoreError};

    /// Holds the first `held` reads until released; later reads pass straight through.
    struct GatedStore {
        held: usize,
        reads: AtomicUsize,
        gate: Notify,
    }

    #[async_trait]
    impl KvStore for GatedStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            if self.reads.fetch_add(1, Ordering::SeqCst) < self.held {
                self.gate.notified().await;
            }
            Ok(None)
        }

        async fn put(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn overrides_take_precedence_over_file_lists() {
        let store = MemoryStore::new();
        store
            .put(BLOCKED_UPSTREAMS_KEY, r#"["evil.example"]"#, None)
            .await
            .unwrap();
        store
            .put(ALLOWED_UPSTREAMS_KEY, "[]", None)
            .await
            .unwrap();
        store
            .put(AUTO_PROXY_PATTERNS_KEY, "{broken", None)
            .await
            .unwrap();

        let runtime = RuntimeConfig::new(GatewayConfig::default(), Some(Arc::new(store)));
        assert!(runtime.load().policy.check_access("google.com").is_err());

        runtime.refresh().await;
        let snapshot = runtime.load();
        assert_eq!(snapshot.config.access.blocked_upstreams, vec!["evil.example"]);
        assert!(snapshot.policy.check_access("google.com").is_ok());
        assert!(snapshot.policy.check_access("cdn.evil.example").is_err());
        // Empty and malformed overrides leave the file values in place.
        assert!(snapshot.config.access.allowed_upstreams.is_empty());
        assert!(snapshot.policy.is_auto_proxy_domain("x.sharepoint.com"));
    }

    #[tokio::test]
    async fn apply_base_keeps_overrides() {
        let store = MemoryStore::new();
        store
            .put(DIRECT_REDIRECT_DOMAINS_KEY, r#"["direct.example"]"#, None)
            .await
            .unwrap();
        let runtime = RuntimeConfig::new(GatewayConfig::default(), Some(Arc::new(store)));

        let mut next = GatewayConfig::default();
        next.access.whitelist_enabled = true;
        next.access.allowed_upstreams = vec!["media.example.org".into()];
        runtime.apply_base(next).await;

        let snapshot = runtime.load();
        assert!(snapshot.policy.whitelist_enabled());
        assert!(snapshot.policy.is_direct_domain("a.direct.example"));
        assert!(!snapshot.policy.is_direct_domain("quark.cn"));
        assert!(snapshot.policy.check_access("media.example.org").is_ok());
    }

    #[tokio::test]
    async fn slow_refresh_never_overwrites_newer_base() {
        // One refresh reads four override keys.
        let store = Arc::new(GatedStore {
            held: 4,
            reads: AtomicUsize::new(0),
            gate: Notify::new(),
        });
        let runtime = Arc::new(RuntimeConfig::new(GatewayConfig::default(), Some(store.clone())));

        let stale = tokio::spawn({
            let runtime = Arc::clone(&runtime);
            async move { runtime.refresh().await }
        });
        while store.reads.load(Ordering::SeqCst) < 4 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut next = GatewayConfig::default();
        next.access.whitelist_enabled = true;
        let reload = tokio::spawn({
            let runtime = Arc::clone(&runtime);
            async move { runtime.apply_base(next).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        store.gate.notify_waiters();
        stale.await.unwrap();
        reload.await.unwrap();

        assert!(runtime.load().policy.whitelist_enabled());
    }

    #[tokio::test]
    async fn refresher_stops_on_shutdown() {
        let runtime = Arc::new(RuntimeConfig::new(GatewayConfig::default(), None));
        let (tx, rx) = broadcast::channel(1);
        let handle = runtime.spawn_refresher(rx);
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
