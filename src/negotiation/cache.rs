//! In-process protocol cache.
//!
//! Bounded map from `hostname:port|default` to the negotiated scheme.
//! Entries expire after the configured TTL; when full, the least recently
//! accessed key is evicted.
//!
//! # Design Decisions
//! - One `Mutex` around a `HashMap` plus a tick-ordered `BTreeMap` index;
//!   every operation is O(log n) and never awaits while holding the lock
//! - A read refreshes recency but not age: TTL counts from the observation

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::routing::target::Scheme;

#[derive(Debug, Clone, Copy)]
struct Entry {
    scheme: Scheme,
    observed_at: Instant,
    tick: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    // access tick → key, oldest first
    recency: BTreeMap<u64, String>,
    next_tick: u64,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.recency.remove(&entry.tick);
        }
    }
}

pub struct ProtocolCache {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl: Duration,
}

impl ProtocolCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The map holds no invariants a panicking writer could break halfway.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look up a live entry and mark it most recently used.
    pub fn get(&self, key: &str) -> Option<Scheme> {
        let mut inner = self.lock();
        let entry = *inner.entries.get(key)?;

        if entry.observed_at.elapsed() >= self.ttl {
            inner.remove(key);
            return None;
        }

        let tick = inner.bump();
        inner.recency.remove(&entry.tick);
        inner.recency.insert(tick, key.to_string());
        if let Some(e) = inner.entries.get_mut(key) {
            e.tick = tick;
        }
        Some(entry.scheme)
    }

    /// Insert or overwrite an entry, evicting the least recently used key when full.
    pub fn insert(&self, key: &str, scheme: Scheme) {
        let mut inner = self.lock();
        inner.remove(key);

        while inner.entries.len() >= self.capacity {
            let Some((_, oldest)) = inner.recency.pop_first() else {
                break;
            };
            inner.entries.remove(&oldest);
        }

        let tick = inner.bump();
        inner.recency.insert(tick, key.to_string());
        inner.entries.insert(
            key.to_string(),
            Entry {
                scheme,
                observed_at: Instant::now(),
                tick,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
