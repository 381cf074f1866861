use std::io;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::{Config, DomainCacheConfig};

use super::eviction;
use super::fs::{FsCache, WriteOutcome};
use super::memory::MemoryCache;
use super::{CacheEntry, CacheKey, CacheName};

/// The two-tier, time-boxed store behind one lookup domain.
///
/// Reads check the in-memory tier first and fall back to the on-disk tier,
/// warming the memory tier on a disk hit. Both tiers validate entries
/// against the domain's TTL and schema version on every read and delete
/// what no longer qualifies.
///
/// The store is an optimization, never a correctness dependency: every
/// storage failure degrades to a miss on the read path and to a memory-only
/// entry on the write path.
#[derive(Debug)]
pub struct TtlStore<T: Clone + Send + Sync + 'static> {
    name: CacheName,
    version: String,
    memory: MemoryCache<T>,
    fs: Option<FsCache>,
}

impl<T> TtlStore<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn from_config(
        name: CacheName,
        config: &Config,
        domain: &DomainCacheConfig,
    ) -> io::Result<Self> {
        let memory = MemoryCache::new(name, domain);
        let fs = FsCache::from_config(name, config, domain.persistent_ttl, domain.version.clone())?;

        Ok(TtlStore {
            name,
            version: domain.version.clone(),
            memory,
            fs,
        })
    }

    /// Returns the cached payload for `key`, or `None` on a miss.
    pub fn get(&self, key: &CacheKey) -> Option<T> {
        metric!(counter("caches.access") += 1, "cache" => self.name.as_ref());

        if let Some(data) = self.memory.get(key) {
            return Some(data);
        }

        let entry = self.fs.as_ref()?.get::<T>(key)?;
        metric!(counter("caches.file.hit") += 1, "cache" => self.name.as_ref());

        // Warm the memory tier with the envelope as-is; its original
        // timestamp keeps governing freshness.
        self.memory.insert(key.clone(), entry.clone());
        Some(entry.data)
    }

    /// Stores a freshly fetched payload in both tiers.
    ///
    /// Returns whether the entry was persisted to disk. A refused or failed
    /// persistent write leaves the entry memory-only; a quota-exceeded write
    /// evicts the oldest entries and retries exactly once.
    pub fn set(&self, key: &CacheKey, data: T) -> bool {
        let entry = CacheEntry::new(data, &self.version);
        self.memory.insert(key.clone(), entry.clone());

        let Some(fs) = self.fs.as_ref() else {
            return false;
        };

        match fs.set(key, &entry) {
            WriteOutcome::Written => true,
            WriteOutcome::TooLarge | WriteOutcome::Failed => false,
            WriteOutcome::QuotaExceeded => {
                metric!(counter("caches.eviction.runs") += 1, "cache" => self.name.as_ref());
                if !eviction::reclaim(fs) {
                    return false;
                }
                // One retry after reclamation; if the quota is still
                // exhausted the entry stays memory-only.
                fs.set(key, &entry) == WriteOutcome::Written
            }
        }
    }

    /// Explicitly removes one entry from both tiers.
    pub fn invalidate(&self, key: &CacheKey) {
        self.memory.invalidate(key);
        if let Some(fs) = self.fs.as_ref() {
            fs.remove(key);
        }
    }

    /// Removes every entry of this domain from both tiers.
    pub fn invalidate_all(&self) {
        self.memory.invalidate_all();
        if let Some(fs) = self.fs.as_ref() {
            fs.clear();
        }
    }
}

impl<T: Clone + Send + Sync + 'static> TtlStore<T> {
    pub fn name(&self) -> CacheName {
        self.name
    }
}
