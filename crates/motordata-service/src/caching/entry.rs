use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The envelope around a cached payload.
///
/// Entries are immutable: a refresh creates and stores a new envelope
/// replacing the old one, it never mutates in place. The timestamp is
/// serialized as epoch milliseconds, which is also the on-disk format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

impl<T> CacheEntry<T> {
    /// Creates a fresh envelope stamped with the current time.
    pub fn new(data: T, version: &str) -> Self {
        CacheEntry {
            data,
            timestamp: Utc::now(),
            version: version.to_owned(),
        }
    }

    /// Whether this entry may still be served.
    ///
    /// An entry is fresh iff it is younger than `ttl` *and* carries the
    /// current schema version. Entries warmed into memory from disk keep
    /// their original timestamp, so this check is authoritative rather than
    /// any cache-internal expiry.
    pub fn is_fresh(&self, ttl: Duration, version: &str) -> bool {
        if self.version != version {
            return false;
        }
        let age = Utc::now().signed_duration_since(self.timestamp);
        // A timestamp in the future (clock adjustment) counts as age zero.
        age.to_std().map_or(true, |age| age < ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_entry() {
        let entry = CacheEntry::new(42u32, "v1");
        assert!(entry.is_fresh(Duration::from_secs(60), "v1"));
    }

    #[test]
    fn test_expired_entry() {
        let mut entry = CacheEntry::new(42u32, "v1");
        entry.timestamp = entry.timestamp - chrono::Duration::seconds(120);
        assert!(!entry.is_fresh(Duration::from_secs(60), "v1"));
    }

    #[test]
    fn test_version_mismatch() {
        let entry = CacheEntry::new(42u32, "v1");
        assert!(!entry.is_fresh(Duration::from_secs(60), "v2"));
    }

    #[test]
    fn test_millisecond_roundtrip() {
        let entry = CacheEntry::new(serde_json::json!({"doors": 5}), "v1");
        let serialized = serde_json::to_string(&entry).unwrap();
        let parsed: CacheEntry<serde_json::Value> = serde_json::from_str(&serialized).unwrap();
        assert_eq!(parsed.version, "v1");
        assert_eq!(
            parsed.timestamp.timestamp_millis(),
            entry.timestamp.timestamp_millis()
        );
    }
}
