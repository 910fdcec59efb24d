//! Upstream protocol negotiation.
//!
//! # Resolution Order
//! ```text
//! explicit hint in path      → scheme (never cached)
//! port 443 / port 80         → https / http (never cached)
//! in-process cache (TTL)     → cached scheme
//! key-value store            → stored scheme, copied into the in-process cache
//! HEAD https://host[:port]/  → status < 500 ? https : http, recorded in both tiers
//! ```
//!
//! # Design Decisions
//! - The probe sits behind `ProtocolProbe` so resolution is testable offline
//! - Store reads that fail count as misses; store writes run in the background
//!   under a timeout and only ever log on failure
//! - A downgrade overwrites both tiers, so it sticks until the TTL runs out

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::schema::NegotiationConfig;
use crate::negotiation::cache::ProtocolCache;
use crate::observability::metrics;
use crate::routing::target::{Scheme, TargetSpec};
use crate::store::{KvStore, StoreError};

/// Decides whether an upstream authority speaks HTTPS.
#[async_trait]
pub trait ProtocolProbe: Send + Sync {
    async fn probe(&self, authority: &str) -> Scheme;
}

/// `HEAD https://{authority}/` with redirects disabled and a bounded wait.
pub struct HttpsProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpsProbe {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl ProtocolProbe for HttpsProbe {
    async fn probe(&self, authority: &str) -> Scheme {
        let url = format!("https://{}/", authority);
        let request = self.client.head(&url).send();

        match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(response)) if response.status().as_u16() < 500 => Scheme::Https,
            Ok(Ok(response)) => {
                tracing::debug!(authority = %authority, status = %response.status(), "https probe got server error");
                Scheme::Http
            }
            Ok(Err(e)) => {
                tracing::debug!(authority = %authority, error = %e, "https probe failed");
                Scheme::Http
            }
            Err(_) => {
                tracing::debug!(authority = %authority, "https probe timed out");
                Scheme::Http
            }
        }
    }
}

/// Where a resolved scheme came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    Hint,
    WellKnownPort,
    Memory,
    Store,
    Probe,
}

impl ResolutionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionSource::Hint => "hint",
            ResolutionSource::WellKnownPort => "well_known_port",
            ResolutionSource::Memory => "memory",
            ResolutionSource::Store => "store",
            ResolutionSource::Probe => "probe",
        }
    }
}

impl fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub scheme: Scheme,
    pub source: ResolutionSource,
}

impl Resolution {
    /// A failed https attempt may fall back to http unless the client forced https.
    pub fn downgradable(&self) -> bool {
        self.scheme == Scheme::Https && self.source != ResolutionSource::Hint
    }
}

#[derive(Serialize, Deserialize)]
struct StoredProtocol {
    proto: Scheme,
}

pub struct ProtocolNegotiator {
    cache: ProtocolCache,
    store: Option<Arc<dyn KvStore>>,
    probe: Arc<dyn ProtocolProbe>,
    ttl: Duration,
    write_timeout: Duration,
}

impl ProtocolNegotiator {
    pub fn new(
        config: &NegotiationConfig,
        store: Option<Arc<dyn KvStore>>,
        probe: Arc<dyn ProtocolProbe>,
        write_timeout: Duration,
    ) -> Self {
        let ttl = Duration::from_secs(config.protocol_cache_ttl_secs);
        Self {
            cache: ProtocolCache::new(config.cache_capacity, ttl),
            store,
            probe,
            ttl,
            write_timeout,
        }
    }

    pub async fn resolve(&self, target: &TargetSpec) -> Resolution {
        let resolution = self.resolve_inner(target).await;
        metrics::record_negotiation(resolution.source.as_str());
        tracing::debug!(
            target = %target.authority(),
            scheme = %resolution.scheme,
            source = %resolution.source,
            "protocol resolved"
        );
        resolution
    }

    async fn resolve_inner(&self, target: &TargetSpec) -> Resolution {
        if let Some(scheme) = target.explicit_protocol {
            return Resolution {
                scheme,
                source: ResolutionSource::Hint,
            };
        }
        match target.port {
            Some(443) => {
                return Resolution {
                    scheme: Scheme::Https,
                    source: ResolutionSource::WellKnownPort,
                }
            }
            Some(80) => {
                return Resolution {
                    scheme: Scheme::Http,
                    source: ResolutionSource::WellKnownPort,
                }
            }
            _ => {}
        }

        let key = target.cache_key();
        if let Some(scheme) = self.cache.get(&key) {
            return Resolution {
                scheme,
                source: ResolutionSource::Memory,
            };
        }

        if let Some(scheme) = self.load_from_store(&key).await {
            self.cache.insert(&key, scheme);
            metrics::record_protocol_cache_size(self.cache.len());
            return Resolution {
                scheme,
                source: ResolutionSource::Store,
            };
        }

        let scheme = self.probe.probe(&target.authority()).await;
        self.record(&key, scheme);
        Resolution {
            scheme,
            source: ResolutionSource::Probe,
        }
    }

    /// Pin the target to http in both tiers after a failed https attempt.
    pub fn downgrade(&self, target: &TargetSpec) {
        let key = target.cache_key();
        tracing::info!(key = %key, "downgrading upstream to http");
        metrics::record_downgrade();
        self.record(&key, Scheme::Http);
    }

    pub fn cache(&self) -> &ProtocolCache {
        &self.cache
    }

    fn record(&self, key: &str, scheme: Scheme) {
        self.cache.insert(key, scheme);
        metrics::record_protocol_cache_size(self.cache.len());

        let Some(store) = self.store.clone() else {
            return;
        };
        let value = match serde_json::to_string(&StoredProtocol { proto: scheme }) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode protocol entry");
                return;
            }
        };
        let store_key = store_key(key);
        let ttl = self.ttl;
        let write_timeout = self.write_timeout;

        tokio::spawn(async move {
            let result = match tokio::time::timeout(
                write_timeout,
                store.put(&store_key, &value, Some(ttl)),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout),
            };
            if let Err(e) = result {
                metrics::record_store_error("put");
                tracing::warn!(key = %store_key, error = %e, "protocol store write failed");
            }
        });
    }

    async fn load_from_store(&self, key: &str) -> Option<Scheme> {
        let store = self.store.as_ref()?;
        let store_key = store_key(key);
        match store.get(&store_key).await {
            Ok(Some(raw)) => match serde_json::from_str::<StoredProtocol>(&raw) {
                Ok(entry) => Some(entry.proto),
                Err(e) => {
                    tracing::warn!(key = %store_key, error = %e, "ignoring malformed protocol entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                metrics::record_store_error("get");
                tracing::warn!(key = %store_key, error = %e, "protocol store read failed");
                None
            }
        }
    }
}

fn store_key(cache_key: &str) -> String {
    format!("proto:{}", cache_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::target::resolve_target;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProbe {
        answer: Scheme,
        calls: AtomicUsize,
    }

    impl CountingProbe {
        fn new(answer: Scheme) -> Arc<Self> {
            Arc::new(Self {
                answer,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProtocolProbe for CountingProbe {
        async fn probe(&self, _authority: &str) -> Scheme {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer
        }
    }

    fn negotiator(
        probe: Arc<CountingProbe>,
        store: Option<Arc<dyn KvStore>>,
    ) -> ProtocolNegotiator {
        ProtocolNegotiator::new(
            &NegotiationConfig::default(),
            store,
            probe,
            Duration::from_secs(1),
        )
    }

    async fn wait_for_store(store: &MemoryStore, key: &str, expected: &str) {
        for _ in 0..50 {
            if store.get(key).await.unwrap().as_deref() == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("store never held {expected} for {key}");
    }

    #[tokio::test]
    async fn test_hint_and_well_known_ports_skip_probe() {
        let probe = CountingProbe::new(Scheme::Https);
        let n = negotiator(probe.clone(), None);

        let hinted = resolve_target("/http/example.com:8443/", None).unwrap();
        let r = n.resolve(&hinted).await;
        assert_eq!(r.scheme, Scheme::Http);
        assert_eq!(r.source, ResolutionSource::Hint);

        let tls = resolve_target("/example.com:443/", None).unwrap();
        assert_eq!(n.resolve(&tls).await.scheme, Scheme::Https);
        let plain = resolve_target("/example.com:80/", None).unwrap();
        assert_eq!(n.resolve(&plain).await.scheme, Scheme::Http);

        assert_eq!(probe.calls(), 0);
        assert!(n.cache().is_empty());
    }

    #[tokio::test]
    async fn test_idempotent_within_ttl() {
        let probe = CountingProbe::new(Scheme::Https);
        let n = negotiator(probe.clone(), None);
        let target = resolve_target("/media.example.org:8920/web", None).unwrap();

        let first = n.resolve(&target).await;
        let second = n.resolve(&target).await;

        assert_eq!(first.scheme, Scheme::Https);
        assert_eq!(first.source, ResolutionSource::Probe);
        assert_eq!(second.scheme, Scheme::Https);
        assert_eq!(second.source, ResolutionSource::Memory);
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test]
    async fn test_downgrade_is_sticky_in_both_tiers() {
        let probe = CountingProbe::new(Scheme::Https);
        let store = MemoryStore::new();
        let n = negotiator(probe.clone(), Some(Arc::new(store.clone())));
        let target = resolve_target("/media.example.org:8096/", None).unwrap();

        let r = n.resolve(&target).await;
        assert!(r.downgradable());
        n.downgrade(&target);

        let after = n.resolve(&target).await;
        assert_eq!(after.scheme, Scheme::Http);
        assert!(!after.downgradable());
        assert_eq!(probe.calls(), 1);

        wait_for_store(&store, "proto:media.example.org:8096", r#"{"proto":"http"}"#).await;

        // A fresh process sharing the store sees the downgrade too.
        let fresh_probe = CountingProbe::new(Scheme::Https);
        let fresh = negotiator(fresh_probe.clone(), Some(Arc::new(store.clone())));
        let r = fresh.resolve(&target).await;
        assert_eq!(r.scheme, Scheme::Http);
        assert_eq!(r.source, ResolutionSource::Store);
        assert_eq!(fresh_probe.calls(), 0);
    }

    #[tokio::test]
    async fn test_malformed_store_entry_falls_through_to_probe() {
        let store = MemoryStore::new();
        store
            .put("proto:odd.example:default", "not json", None)
            .await
            .unwrap();
        let probe = CountingProbe::new(Scheme::Http);
        let n = negotiator(probe.clone(), Some(Arc::new(store)));

        let target = resolve_target("/odd.example/", None).unwrap();
        let r = n.resolve(&target).await;
        assert_eq!(r.source, ResolutionSource::Probe);
        assert_eq!(r.scheme, Scheme::Http);
        assert_eq!(probe.calls(), 1);
    }

    #[test]
    fn test_hint_is_never_downgradable() {
        let hinted = Resolution {
            scheme: Scheme::Https,
            source: ResolutionSource::Hint,
        };
        assert!(!hinted.downgradable());
        let port = Resolution {
            scheme: Scheme::Https,
            source: ResolutionSource::WellKnownPort,
        };
        assert!(port.downgradable());
    }
}
