// Local cache tier
//
// Typed record / versioned-list layer over the bounded table. One instance
// per worker; cheap to clone (shared table behind one mutex). Version tokens
// live in the same table under `{entity}:version` and default to 1 when
// absent; list reads never bump them.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cache::keys::{self, list_key_prefix, parse_list_version};
use crate::cache::table::{BoundedTable, TableStats};
use crate::config::CacheSettings;
use crate::error::Result;

/// Eviction batch size for the local table.
const EVICT_BUFFER: usize = 8;

#[derive(Clone)]
pub struct LocalCache {
    table: Arc<Mutex<BoundedTable>>,
    settings: CacheSettings,
}

impl LocalCache {
    pub fn new(settings: CacheSettings) -> Self {
        let table = BoundedTable::new(
            settings.local_max_entries,
            EVICT_BUFFER,
            settings.local_key_max,
            settings.record_ttl_secs,
        );
        Self {
            table: Arc::new(Mutex::new(table)),
            settings,
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    pub fn stats(&self) -> TableStats {
        self.table.lock().stats()
    }

    // Raw keyspace operations; the tiered cache composes these with the
    // remote tier under the same keys.

    pub fn get(&self, key: &str) -> Option<String> {
        self.table.lock().get(key).map(|row| row.value)
    }

    pub fn set(&self, key: &str, value: &str, ttl: Option<u64>) -> Result<()> {
        self.table.lock().set(key, value.to_string(), ttl)
    }

    pub fn delete(&self, key: &str) -> bool {
        self.table.lock().delete(key)
    }

    pub fn incr(&self, key: &str, delta: i64, ttl: Option<u64>) -> Result<i64> {
        self.table.lock().incr(key, delta, ttl)
    }

    // Record keyspace

    pub fn get_record(&self, entity: &str, column: &str, value: &str) -> Option<String> {
        self.get(&keys::record_key(entity, column, value))
    }

    pub fn set_record(
        &self,
        entity: &str,
        column: &str,
        value: &str,
        data: &str,
        ttl: Option<u64>,
    ) -> Result<()> {
        let ttl = ttl.or(Some(self.settings.record_ttl_secs));
        self.set(&keys::record_key(entity, column, value), data, ttl)
    }

    pub fn delete_record(&self, entity: &str, column: &str, value: &str) -> bool {
        self.delete(&keys::record_key(entity, column, value))
    }

    // Versioned list keyspace

    /// Current version token; 1 when the row is absent or expired.
    pub fn version(&self, entity: &str) -> u64 {
        self.get(&keys::version_key(entity))
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(1)
    }

    /// Pin the local version token (refresh from the authoritative remote).
    pub fn set_version(&self, entity: &str, version: u64) -> Result<()> {
        self.set(
            &keys::version_key(entity),
            &version.to_string(),
            Some(self.settings.record_ttl_secs),
        )
    }

    pub fn get_list(&self, entity: &str, query: &BTreeMap<String, String>) -> Option<String> {
        let version = self.version(entity);
        self.get(&keys::list_key(entity, version, query))
    }

    pub fn set_list(
        &self,
        entity: &str,
        query: &BTreeMap<String, String>,
        data: &str,
        ttl: Option<u64>,
    ) -> Result<()> {
        let version = self.version(entity);
        let ttl = ttl.or(Some(self.settings.list_ttl_secs));
        self.set(&keys::list_key(entity, version, query), data, ttl)
    }

    /// Bump the version token, invalidating every cached list of the entity.
    /// An absent token is materialized at 1 first so the result always
    /// exceeds the default read value.
    pub fn invalidate_lists(&self, entity: &str) -> Result<u64> {
        let key = keys::version_key(entity);
        let mut table = self.table.lock();
        let ttl = Some(self.settings.record_ttl_secs);
        if table.get(&key).is_none() {
            table.set(&key, "1".to_string(), ttl)?;
        }
        let version = table.incr(&key, 1, ttl)?;
        Ok(version.max(0) as u64)
    }

    /// Delete list entries whose version stamp fell `keep` or more behind the
    /// entity's current token. Keys are snapshotted before any deletion.
    pub fn gc_old_list_versions(&self, entities: &[&str], keep: u64) -> usize {
        let mut removed = 0usize;
        let mut table = self.table.lock();
        let snapshot = table.keys();
        for entity in entities {
            let current = table
                .get(&keys::version_key(entity))
                .and_then(|row| row.value.trim().parse::<u64>().ok())
                .unwrap_or(1);
            let Some(cutoff) = current.checked_sub(keep) else {
                continue;
            };
            let prefix = list_key_prefix(entity);
            for key in snapshot.iter().filter(|k| k.starts_with(&prefix)) {
                if let Some(version) = parse_list_version(key, entity) {
                    if version <= cutoff && table.delete(key) {
                        removed += 1;
                    }
                }
            }
        }
        removed
    }

    /// Bounded expiry sweep of the underlying table.
    pub fn gc(&self) -> usize {
        self.table.lock().gc(self.settings.gc_check_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> LocalCache {
        LocalCache::new(CacheSettings::default())
    }

    fn page(n: u32) -> BTreeMap<String, String> {
        let mut q = BTreeMap::new();
        q.insert("page".to_string(), n.to_string());
        q
    }

    #[test]
    fn test_record_roundtrip() {
        let c = cache();
        c.set_record("users", "id", "1", "{\"id\":1}", None).unwrap();
        assert_eq!(c.get_record("users", "id", "1").unwrap(), "{\"id\":1}");
        assert!(c.delete_record("users", "id", "1"));
        assert!(c.get_record("users", "id", "1").is_none());
    }

    #[test]
    fn test_version_defaults_to_one() {
        let c = cache();
        assert_eq!(c.version("users"), 1);
    }

    #[test]
    fn test_list_invalidated_by_version_bump() {
        let c = cache();
        c.set_list("users", &page(1), "[1,2,3]", None).unwrap();
        assert_eq!(c.get_list("users", &page(1)).unwrap(), "[1,2,3]");

        let version = c.invalidate_lists("users").unwrap();
        assert!(version > 1, "first bump must exceed the default version");
        assert!(c.get_list("users", &page(1)).is_none());

        // Re-populate under the new version.
        c.set_list("users", &page(1), "[4]", None).unwrap();
        assert_eq!(c.get_list("users", &page(1)).unwrap(), "[4]");
    }

    #[test]
    fn test_get_list_does_not_bump_version() {
        let c = cache();
        assert!(c.get_list("users", &page(1)).is_none());
        assert_eq!(c.version("users"), 1);
    }

    #[test]
    fn test_version_bumps_are_monotonic() {
        let c = cache();
        let first = c.invalidate_lists("users").unwrap();
        let second = c.invalidate_lists("users").unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_gc_old_list_versions() {
        let c = cache();
        c.set_list("users", &page(1), "v1-list", None).unwrap();
        // Bump twice: v1 lists are now two generations behind.
        c.invalidate_lists("users").unwrap();
        c.invalidate_lists("users").unwrap();
        assert_eq!(c.version("users"), 3);
        c.set_list("users", &page(1), "v3-list", None).unwrap();

        let removed = c.gc_old_list_versions(&["users"], 2);
        assert_eq!(removed, 1);
        assert_eq!(c.get_list("users", &page(1)).unwrap(), "v3-list");
    }

    #[test]
    fn test_gc_keeps_recent_versions() {
        let c = cache();
        c.set_list("users", &page(1), "v1-list", None).unwrap();
        c.invalidate_lists("users").unwrap();
        // current=2, keep=2: cutoff would be 0, nothing is old enough.
        assert_eq!(c.gc_old_list_versions(&["users"], 2), 0);
    }

    #[test]
    fn test_set_version_pins_remote_value() {
        let c = cache();
        c.set_version("users", 9).unwrap();
        assert_eq!(c.version("users"), 9);
    }
}
