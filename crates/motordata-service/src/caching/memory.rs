use std::time::Duration;

use crate::config::DomainCacheConfig;

use super::{CacheEntry, CacheKey, CacheName};

/// The volatile in-process cache tier.
///
/// Entries live for the domain's memory TTL and are dropped on process exit.
/// Freshness is always re-checked against the envelope on read: entries
/// warmed from the on-disk tier carry their original timestamp, which may be
/// older than their insertion into this cache.
pub(super) struct MemoryCache<T: Clone + Send + Sync + 'static> {
    name: CacheName,
    ttl: Duration,
    version: String,
    cache: moka::sync::Cache<CacheKey, CacheEntry<T>>,
}

impl<T: Clone + Send + Sync + 'static> std::fmt::Debug for MemoryCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("name", &self.name)
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> MemoryCache<T> {
    pub fn new(name: CacheName, config: &DomainCacheConfig) -> Self {
        let cache = moka::sync::Cache::builder()
            .max_capacity(config.capacity)
            .name(name.as_ref())
            .time_to_live(config.memory_ttl)
            .build();

        MemoryCache {
            name,
            ttl: config.memory_ttl,
            version: config.version.clone(),
            cache,
        }
    }

    /// Returns a fresh entry's payload, actively dropping stale or
    /// foreign-version entries.
    pub fn get(&self, key: &CacheKey) -> Option<T> {
        let entry = self.cache.get(key)?;
        if !entry.is_fresh(self.ttl, &self.version) {
            tracing::trace!("Dropping stale {} memory entry for {}", self.name, key);
            self.cache.invalidate(key);
            return None;
        }
        metric!(counter("caches.memory.hit") += 1, "cache" => self.name.as_ref());
        Some(entry.data)
    }

    pub fn insert(&self, key: CacheKey, entry: CacheEntry<T>) {
        self.cache.insert(key, entry);
    }

    pub fn invalidate(&self, key: &CacheKey) {
        self.cache.invalidate(key);
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}
