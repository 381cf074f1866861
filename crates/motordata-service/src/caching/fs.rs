use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::Config;

use super::{CacheEntry, CacheKey, CacheName};

/// The persistent on-disk cache tier.
///
/// Every entry is one JSON envelope file, `{domain}/{key}.json` inside the
/// configured cache directory. The tier is strictly best-effort: every I/O
/// or parse problem on the read path degrades to a cache miss, and the write
/// path reports its outcome instead of failing the lookup.
#[derive(Debug)]
pub(super) struct FsCache {
    name: CacheName,
    dir: PathBuf,
    tmp_dir: PathBuf,
    ttl: Duration,
    version: String,
    max_entry_size: u64,
    max_total_size: u64,
}

/// What happened to a persistent write.
#[derive(Debug, PartialEq, Eq)]
pub(super) enum WriteOutcome {
    Written,
    /// The serialized envelope exceeds the per-entry size limit; the entry
    /// stays memory-only.
    TooLarge,
    /// The write would exceed the directory's byte budget. The caller may
    /// reclaim space and retry.
    QuotaExceeded,
    /// Any other storage failure, already logged.
    Failed,
}

impl FsCache {
    /// Creates the on-disk tier for a domain, or `None` when no cache
    /// directory is configured.
    pub fn from_config(
        name: CacheName,
        config: &Config,
        ttl: Duration,
        version: String,
    ) -> io::Result<Option<Self>> {
        let Some(dir) = config.cache_dir(name.as_ref()) else {
            return Ok(None);
        };
        // `cache_dir` is `Some` here, so the tmp sibling resolves as well.
        let Some(tmp_dir) = config.cache_dir("tmp") else {
            return Ok(None);
        };
        std::fs::create_dir_all(&dir)?;

        Ok(Some(FsCache {
            name,
            dir,
            tmp_dir,
            ttl,
            version,
            max_entry_size: config.max_entry_size,
            max_total_size: config.max_cache_size,
        }))
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.fs_segment()))
    }

    /// Looks up a fresh envelope, actively deleting stale, foreign-version
    /// or unreadable entries.
    pub fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<CacheEntry<T>> {
        let path = self.entry_path(key);
        let bytes = match catch_not_found(|| std::fs::read(&path)) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                tracing::debug!(
                    error = &e as &dyn std::error::Error,
                    "Failed to read {} cache file at {}",
                    self.name,
                    path.display(),
                );
                return None;
            }
        };

        let entry = match serde_json::from_slice::<CacheEntry<T>>(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!(
                    error = &e as &dyn std::error::Error,
                    "Removing unreadable {} cache file at {}",
                    self.name,
                    path.display(),
                );
                self.remove(key);
                return None;
            }
        };

        if !entry.is_fresh(self.ttl, &self.version) {
            tracing::trace!("Removing stale {} cache file at {}", self.name, path.display());
            self.remove(key);
            return None;
        }

        metric!(
            time_raw("caches.file.size") = bytes.len() as u64,
            "hit" => "true",
            "cache" => self.name.as_ref(),
        );
        Some(entry)
    }

    /// Persists an envelope, reporting the outcome instead of failing.
    ///
    /// The write goes through a tempfile in a sibling directory and is moved
    /// into place atomically, so readers never observe a partial envelope.
    pub fn set<T: Serialize>(&self, key: &CacheKey, entry: &CacheEntry<T>) -> WriteOutcome {
        let bytes = match serde_json::to_vec(entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    "Failed to serialize {} cache entry",
                    self.name,
                );
                return WriteOutcome::Failed;
            }
        };

        if bytes.len() as u64 > self.max_entry_size {
            tracing::debug!(
                "Refusing to persist {} entry of {} bytes for {}",
                self.name,
                bytes.len(),
                key,
            );
            return WriteOutcome::TooLarge;
        }

        match self.total_size() {
            Ok(used) if used + bytes.len() as u64 > self.max_total_size => {
                return WriteOutcome::QuotaExceeded;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    "Failed to measure {} cache directory",
                    self.name,
                );
                return WriteOutcome::Failed;
            }
        }

        let path = self.entry_path(key);
        match self.persist(&bytes, &path) {
            Ok(()) => {
                metric!(
                    time_raw("caches.file.size") = bytes.len() as u64,
                    "hit" => "false",
                    "cache" => self.name.as_ref(),
                );
                WriteOutcome::Written
            }
            Err(e) if is_storage_full(&e) => WriteOutcome::QuotaExceeded,
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to persist cache file",
                );
                WriteOutcome::Failed
            }
        }
    }

    fn persist(&self, bytes: &[u8], path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(&self.tmp_dir)?;
        let mut temp_file = tempfile::Builder::new()
            .prefix("tmp")
            .tempfile_in(&self.tmp_dir)?;
        temp_file.write_all(bytes)?;
        temp_file.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Removes a single entry; missing files are fine.
    pub fn remove(&self, key: &CacheKey) {
        let path = self.entry_path(key);
        if let Err(e) = catch_not_found(|| std::fs::remove_file(&path)) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %path.display(),
                "Failed to remove cache file",
            );
        }
    }

    /// Removes every entry of this domain.
    pub fn clear(&self) {
        for (path, _) in self.scan_entries() {
            if let Err(e) = catch_not_found(|| std::fs::remove_file(&path)) {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to remove cache file",
                );
            }
        }
    }

    /// Enumerates all entries with their envelope timestamps (epoch millis).
    ///
    /// Entries whose envelope cannot be parsed report timestamp `0`, which
    /// sorts them first for eviction.
    pub fn scan_entries(&self) -> Vec<(PathBuf, i64)> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(
                    error = &e as &dyn std::error::Error,
                    "Failed to enumerate {} cache directory",
                    self.name,
                );
                return Vec::new();
            }
        };

        entries
            .filter_map(|dirent| {
                let path = dirent.ok()?.path();
                if path.extension().map_or(true, |ext| ext != "json") {
                    return None;
                }
                let timestamp = std::fs::read(&path)
                    .ok()
                    .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok())
                    .and_then(|envelope| envelope.get("timestamp")?.as_i64())
                    .unwrap_or(0);
                Some((path, timestamp))
            })
            .collect()
    }

    /// Total bytes currently used by this domain's entries.
    fn total_size(&self) -> io::Result<u64> {
        let mut total = 0;
        for dirent in std::fs::read_dir(&self.dir)? {
            let metadata = dirent?.metadata()?;
            if metadata.is_file() {
                total += metadata.len();
            }
        }
        Ok(total)
    }

    pub fn name(&self) -> CacheName {
        self.name
    }
}

fn is_storage_full(e: &io::Error) -> bool {
    // ENOSPC is 28 on both Linux and macOS.
    e.raw_os_error() == Some(28)
}

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
