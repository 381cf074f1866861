use super::fs::{catch_not_found, FsCache};

/// Reclaims space in a domain's on-disk cache after a quota-exceeded write.
///
/// Enumerates all entries, sorts them by envelope timestamp ascending
/// (unparsable envelopes count as oldest) and removes the oldest ⌈20%⌉,
/// at least one. Returns whether anything was removed, so the caller can
/// decide to retry the failed write once.
///
/// The scan-and-delete is not transactional: entries written concurrently
/// are either seen or not, and entries this pass does not touch are never
/// affected.
pub(super) fn reclaim(cache: &FsCache) -> bool {
    let mut entries = cache.scan_entries();
    if entries.is_empty() {
        return false;
    }

    entries.sort_by_key(|&(_, timestamp)| timestamp);
    let evict = entries.len().div_ceil(5);

    let mut removed = 0i64;
    for (path, _) in entries.iter().take(evict) {
        match catch_not_found(|| std::fs::remove_file(path)) {
            // A concurrent remove counts: the space is gone either way.
            Ok(_) => removed += 1,
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to evict cache file",
                );
            }
        }
    }

    tracing::debug!(
        "Evicted {removed} of {} entries from the {} cache",
        entries.len(),
        cache.name(),
    );
    metric!(
        counter("caches.eviction.removed") += removed,
        "cache" => cache.name().as_ref(),
    );

    removed > 0
}
