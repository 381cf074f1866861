use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};

use crate::config::Config;
use crate::test;

use super::eviction;
use super::fs::{FsCache, WriteOutcome};
use super::*;

fn disk_config(cache_dir: &Path) -> Config {
    Config {
        cache_dir: Some(cache_dir.to_path_buf()),
        ..Default::default()
    }
}

fn store(config: &Config) -> TtlStore<Value> {
    TtlStore::from_config(CacheName::TechSpecs, config, &config.caches.tech_specs).unwrap()
}

fn entry_file(cache_dir: &Path, key: &CacheKey) -> std::path::PathBuf {
    cache_dir
        .join(CacheName::TechSpecs.as_ref())
        .join(format!("{}.json", key.fs_segment()))
}

/// An envelope that was created `age` ago.
fn aged_entry(data: Value, version: &str, age: Duration) -> CacheEntry<Value> {
    let mut entry = CacheEntry::new(data, version);
    entry.timestamp = Utc::now() - chrono::Duration::from_std(age).unwrap();
    entry
}

fn fs_cache(config: &Config) -> FsCache {
    FsCache::from_config(
        CacheName::TechSpecs,
        config,
        config.caches.tech_specs.persistent_ttl,
        config.caches.tech_specs.version.clone(),
    )
    .unwrap()
    .unwrap()
}

#[test]
fn test_memory_roundtrip() {
    test::setup();

    let config = Config::default();
    let store = store(&config);
    let key = CacheKey::for_testing("tech_specs_ford_focus");

    assert_eq!(store.get(&key), None);
    store.set(&key, json!({ "doors": 5 }));
    assert_eq!(store.get(&key), Some(json!({ "doors": 5 })));
}

#[test]
fn test_memory_expiry() {
    test::setup();

    let mut config = Config::default();
    config.caches.tech_specs.memory_ttl = Duration::from_millis(50);
    let store = store(&config);
    let key = CacheKey::for_testing("tech_specs_ford_focus");

    store.set(&key, json!(1));
    assert_eq!(store.get(&key), Some(json!(1)));

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(store.get(&key), None);
}

#[test]
fn test_disk_roundtrip_and_warming() {
    test::setup();

    let cache_dir = test::tempdir();
    let config = disk_config(cache_dir.path());
    let key = CacheKey::for_testing("tech_specs_ford_focus");

    let first = store(&config);
    assert!(first.set(&key, json!({ "doors": 5 })));

    // A fresh store has an empty memory tier and must hit the disk.
    let second = store(&config);
    assert_eq!(second.get(&key), Some(json!({ "doors": 5 })));

    // The disk hit warmed the memory tier: the entry survives file removal.
    std::fs::remove_file(entry_file(cache_dir.path(), &key)).unwrap();
    assert_eq!(second.get(&key), Some(json!({ "doors": 5 })));
}

#[test]
fn test_version_mismatch_deletes_entry() {
    test::setup();

    let cache_dir = test::tempdir();
    let config = disk_config(cache_dir.path());
    let key = CacheKey::for_testing("tech_specs_ford_focus");

    store(&config).set(&key, json!(1));
    assert!(entry_file(cache_dir.path(), &key).exists());

    let mut v2_config = disk_config(cache_dir.path());
    v2_config.caches.tech_specs.version = "v2".into();

    // Read under the new schema version: miss, and the stale file is gone.
    let v2_store = store(&v2_config);
    assert_eq!(v2_store.get(&key), None);
    assert!(!entry_file(cache_dir.path(), &key).exists());
}

#[test]
fn test_expired_disk_entry_deleted() {
    test::setup();

    let cache_dir = test::tempdir();
    let config = disk_config(cache_dir.path());
    let fs = fs_cache(&config);
    let key = CacheKey::for_testing("tech_specs_ford_focus");

    let expired = aged_entry(json!(1), "v1", Duration::from_secs(25 * 3600));
    assert_eq!(fs.set(&key, &expired), WriteOutcome::Written);

    assert_eq!(store(&config).get(&key), None);
    assert!(!entry_file(cache_dir.path(), &key).exists());
}

#[test]
fn test_unreadable_disk_entry_is_a_miss() {
    test::setup();

    let cache_dir = test::tempdir();
    let config = disk_config(cache_dir.path());
    let key = CacheKey::for_testing("tech_specs_ford_focus");

    let path = entry_file(cache_dir.path(), &key);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"not an envelope").unwrap();

    assert_eq!(store(&config).get(&key), None);
    assert!(!path.exists());
}

#[test]
fn test_oversized_entry_stays_memory_only() {
    test::setup();

    let cache_dir = test::tempdir();
    let mut config = disk_config(cache_dir.path());
    config.max_entry_size = 64;
    let key = CacheKey::for_testing("tech_specs_ford_focus");

    let big = json!({ "description": "x".repeat(256) });
    let store_a = store(&config);
    assert!(!store_a.set(&key, big.clone()));

    // Served from memory in this process, not persisted for the next one.
    assert_eq!(store_a.get(&key), Some(big));
    assert_eq!(store(&config).get(&key), None);
}

#[test]
fn test_reclaim_removes_oldest_fifth() {
    test::setup();

    let cache_dir = test::tempdir();
    let config = disk_config(cache_dir.path());
    let fs = fs_cache(&config);

    for i in 0..10u32 {
        let key = CacheKey::for_testing(format!("entry_{i}"));
        // entry_0 is the oldest, entry_9 the freshest
        let entry = aged_entry(json!(i), "v1", Duration::from_secs(600 - 60 * i as u64));
        assert_eq!(fs.set(&key, &entry), WriteOutcome::Written);
    }

    assert!(eviction::reclaim(&fs));

    let remaining: Vec<_> = fs.scan_entries();
    assert_eq!(remaining.len(), 8);
    for i in 0..2u32 {
        let key = CacheKey::for_testing(format!("entry_{i}"));
        assert!(!entry_file(cache_dir.path(), &key).exists());
    }
}

#[test]
fn test_reclaim_prefers_unparsable_entries() {
    test::setup();

    let cache_dir = test::tempdir();
    let config = disk_config(cache_dir.path());
    let fs = fs_cache(&config);

    for i in 0..3u32 {
        let key = CacheKey::for_testing(format!("entry_{i}"));
        let entry = aged_entry(json!(i), "v1", Duration::from_secs(60));
        assert_eq!(fs.set(&key, &entry), WriteOutcome::Written);
    }
    let garbage = cache_dir
        .path()
        .join(CacheName::TechSpecs.as_ref())
        .join("garbage.json");
    std::fs::write(&garbage, b"junk").unwrap();

    // ceil(4 * 20%) = 1, and the unparsable entry counts as the oldest.
    assert!(eviction::reclaim(&fs));
    assert!(!garbage.exists());
    assert_eq!(fs.scan_entries().len(), 3);
}

#[test]
fn test_reclaim_on_empty_cache() {
    test::setup();

    let cache_dir = test::tempdir();
    let config = disk_config(cache_dir.path());
    let fs = fs_cache(&config);

    assert!(!eviction::reclaim(&fs));
}

#[test]
fn test_quota_recovery_retries_the_write() {
    test::setup();

    let cache_dir = test::tempdir();
    let mut config = disk_config(cache_dir.path());
    let fs = fs_cache(&config);

    // Ten aged entries of ~120 bytes each; then squeeze the quota so the
    // next write does not fit without reclamation.
    let payload = "x".repeat(64);
    for i in 0..10u32 {
        let key = CacheKey::for_testing(format!("entry_{i}"));
        let entry = aged_entry(json!({ "pad": payload }), "v1", Duration::from_secs(600 - 60 * i as u64));
        assert_eq!(fs.set(&key, &entry), WriteOutcome::Written);
    }
    let used = fs.scan_entries().len();
    assert_eq!(used, 10);

    let entry_size = std::fs::metadata(entry_file(cache_dir.path(), &CacheKey::for_testing("entry_0")))
        .unwrap()
        .len();
    config.max_cache_size = entry_size * 10 + entry_size / 2;

    let store = store(&config);
    let key = CacheKey::for_testing("tech_specs_ford_focus");
    assert!(store.set(&key, json!({ "pad": payload })));

    // The two oldest entries were evicted, the new entry landed on disk.
    assert!(!entry_file(cache_dir.path(), &CacheKey::for_testing("entry_0")).exists());
    assert!(!entry_file(cache_dir.path(), &CacheKey::for_testing("entry_1")).exists());
    assert!(entry_file(cache_dir.path(), &key).exists());
    assert_eq!(fs_cache(&config).scan_entries().len(), 9);
}

#[test]
fn test_quota_still_exhausted_gives_up() {
    test::setup();

    let cache_dir = test::tempdir();
    let mut config = disk_config(cache_dir.path());
    // Nothing to evict, and no write will ever fit.
    config.max_cache_size = 16;
    let key = CacheKey::for_testing("tech_specs_ford_focus");

    let store = store(&config);
    assert!(!store.set(&key, json!({ "doors": 5 })));

    // The lookup still succeeds from memory; the disk stays empty.
    assert_eq!(store.get(&key), Some(json!({ "doors": 5 })));
    assert_eq!(fs_cache(&config).scan_entries().len(), 0);
}

#[test]
fn test_invalidate() {
    test::setup();

    let cache_dir = test::tempdir();
    let config = disk_config(cache_dir.path());
    let store = store(&config);
    let key = CacheKey::for_testing("tech_specs_ford_focus");

    store.set(&key, json!(1));
    store.invalidate(&key);

    assert_eq!(store.get(&key), None);
    assert!(!entry_file(cache_dir.path(), &key).exists());
}

#[test]
fn test_invalidate_all() {
    test::setup();

    let cache_dir = test::tempdir();
    let config = disk_config(cache_dir.path());
    let store = store(&config);

    for i in 0..4u32 {
        store.set(&CacheKey::for_testing(format!("entry_{i}")), json!(i));
    }
    store.invalidate_all();

    for i in 0..4u32 {
        assert_eq!(store.get(&CacheKey::for_testing(format!("entry_{i}"))), None);
    }
    assert_eq!(fs_cache(&config).scan_entries().len(), 0);
}
