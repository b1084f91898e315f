//! Bounded, expiring key cache used for every dedup set.
//!
//! Entries leave in insertion order: either when they outlive the TTL or
//! when the cache is full and a new key arrives. Lookups use `peek` so they
//! never reorder the underlying LRU, which keeps it insertion-ordered.
//! Expiry is lazy and runs on each access rather than on a timer.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

#[derive(Debug)]
pub struct TtlCache<V = ()> {
    entries: LruCache<String, (Instant, V)>,
    ttl: Duration,
}

impl<V> TtlCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    /// Insert `key`. Returns false (and keeps the old value) if the key is
    /// already present and unexpired.
    pub fn insert(&mut self, key: impl Into<String>, value: V, now: Instant) -> bool {
        self.prune(now);
        let key = key.into();
        if self.entries.contains(&key) {
            return false;
        }
        if let Some((evicted, _)) = self.entries.push(key, (now, value)) {
            tracing::trace!(key = %evicted, "dedup cache full, evicted oldest entry");
        }
        true
    }

    pub fn contains(&mut self, key: &str, now: Instant) -> bool {
        self.prune(now);
        self.entries.contains(key)
    }

    pub fn get(&mut self, key: &str, now: Instant) -> Option<&V> {
        self.prune(now);
        self.entries.peek(key).map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        self.entries.pop(key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drop every entry older than the TTL.
    pub fn prune(&mut self, now: Instant) {
        while let Some((_, (inserted_at, _))) = self.entries.peek_lru() {
            if now.saturating_duration_since(*inserted_at) < self.ttl {
                break;
            }
            self.entries.pop_lru();
        }
    }
}

impl TtlCache<()> {
    /// Set-style insert.
    pub fn mark(&mut self, key: impl Into<String>, now: Instant) -> bool {
        self.insert(key, (), now)
    }
}
