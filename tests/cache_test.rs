// Cache laws from the outside: bounded-table eviction and TTL soundness,
// keyspace stability, and version-token list invalidation on the local tier.

use std::collections::BTreeMap;

use swift_crud::cache::keys::{canonical_query, list_key, record_key, truncate_key, version_key};
use swift_crud::cache::{BoundedTable, LocalCache};
use swift_crud::config::CacheSettings;

fn query(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn small_settings() -> CacheSettings {
    CacheSettings {
        local_max_entries: 64,
        local_key_max: 56,
        ..CacheSettings::default()
    }
}

#[test]
fn test_table_at_capacity_evicts_exactly_buffer() {
    let mut table = BoundedTable::new(6, 2, 56, 300);
    // Four rows bring free slots down to the buffer reserve.
    for i in 0..4 {
        table.set(&format!("k{}", i), "v".to_string(), None).unwrap();
    }
    assert_eq!(table.len(), 4);

    // The next insert must evict a batch of exactly `buffer` before landing.
    table.set("k4", "v".to_string(), None).unwrap();
    assert_eq!(table.len(), 3);
    assert_eq!(table.stats().evictions, 2);
    assert!(table.get("k0").is_none());
    assert!(table.get("k1").is_none());
    assert!(table.get("k2").is_some());
    assert!(table.get("k3").is_some());
    assert!(table.get("k4").is_some());
}

#[test]
fn test_ttl_soundness_set_then_absent_at_expiry() {
    let mut table = BoundedTable::new(8, 2, 56, 300);
    table.set("soon", "v".to_string(), Some(0)).unwrap();
    table.set("later", "v".to_string(), Some(600)).unwrap();
    // expires_at <= now means absent even though the row is still physical.
    assert!(table.get("soon").is_none());
    assert!(table.get("later").is_some());
}

#[test]
fn test_set_then_get_within_ttl() {
    let cache = LocalCache::new(small_settings());
    cache.set("k", "v", Some(300)).unwrap();
    assert_eq!(cache.get("k").as_deref(), Some("v"));
}

#[test]
fn test_set_invalidate_get_is_absent() {
    let cache = LocalCache::new(small_settings());
    cache
        .set_record("users", "id", "1", "{\"id\":1}", None)
        .unwrap();
    assert!(cache.get_record("users", "id", "1").is_some());
    cache.delete_record("users", "id", "1");
    assert!(cache.get_record("users", "id", "1").is_none());
}

#[test]
fn test_set_list_invalidate_lists_get_is_absent() {
    let cache = LocalCache::new(small_settings());
    let q = query(&[("page", "1")]);
    cache.set_list("users", &q, "[1]", None).unwrap();
    assert!(cache.get_list("users", &q).is_some());

    cache.invalidate_lists("users").unwrap();
    assert!(
        cache.get_list("users", &q).is_none(),
        "version bump must orphan the previous list generation"
    );
}

#[test]
fn test_version_monotonicity() {
    let cache = LocalCache::new(small_settings());
    let mut last = cache.version("users");
    for _ in 0..5 {
        let bumped = cache.invalidate_lists("users").unwrap();
        assert!(bumped > last);
        last = bumped;
    }
}

#[test]
fn test_incr_n_times_reaches_n() {
    let cache = LocalCache::new(small_settings());
    for expected in 1..=10i64 {
        assert_eq!(cache.incr("counter", 1, Some(300)).unwrap(), expected);
    }
}

#[test]
fn test_remote_keyspace_formats_are_frozen() {
    assert_eq!(record_key("users", "email", "a@b"), "users:record:email:a@b");
    assert_eq!(version_key("items"), "items:version");

    let q = query(&[("per_page", "20"), ("page", "1")]);
    assert_eq!(canonical_query(&q), "page=1&per_page=20");
    let key = list_key("users", 2, &q);
    assert!(key.starts_with("users:list:v2:"));
    assert_eq!(key.len(), "users:list:v2:".len() + 64);
}

#[test]
fn test_truncated_keys_collide_but_remote_carries_full_key() {
    let max = 56;
    let a = format!("users:record:email:{}@example.com", "a".repeat(60));
    let b = format!("users:record:email:{}@example.com", "a".repeat(61));
    let ta = truncate_key(&a, max);
    let tb = truncate_key(&b, max);
    // Local collision is tolerated by contract.
    assert_eq!(ta, tb);
    // The untruncated (remote) keys stay distinct.
    assert_ne!(a, b);
}

#[test]
fn test_local_gc_reaps_stale_generations() {
    let cache = LocalCache::new(small_settings());
    let q = query(&[("page", "1")]);
    cache.set_list("users", &q, "gen1", None).unwrap();
    cache.invalidate_lists("users").unwrap();
    cache.set_list("users", &q, "gen2", None).unwrap();
    cache.invalidate_lists("users").unwrap();
    cache.set_list("users", &q, "gen3", None).unwrap();

    // current = 3; keep 2 generations => only gen1 (v1) goes.
    let removed = cache.gc_old_list_versions(&["users"], 2);
    assert_eq!(removed, 1);
    assert_eq!(cache.get_list("users", &q).as_deref(), Some("gen3"));
}
