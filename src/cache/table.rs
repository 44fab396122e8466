// Bounded in-process table
//
// Fixed-capacity map from (length-bounded) string keys to fixed-schema rows
// with strict LRU eviction and per-entry TTL. Recency lives in a lazy queue
// of (key, seq) stamps: a touch pushes a fresh stamp and the old one becomes
// stale, so get/set stay O(1) amortized and eviction skips stale stamps.
//
// Callers serialize access with a mutex; nothing here yields.

use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::cache::keys::truncate_key;
use crate::error::{Result, ServiceError};

/// One cached row. `value` is opaque UTF-8 (JSON for records and lists,
/// a decimal integer for counters and version tokens).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRow {
    pub value: String,
    pub created_at: u64,
    pub expires_at: u64,
    pub last_access: u64,
    pub usage_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired_drops: u64,
}

struct Slot {
    row: TableRow,
    seq: u64,
}

pub struct BoundedTable {
    capacity: usize,
    evict_buffer: usize,
    key_max: usize,
    default_ttl: u64,
    rows: HashMap<String, Slot>,
    lru: VecDeque<(String, u64)>,
    seq: u64,
    stats: TableStats,
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl BoundedTable {
    pub fn new(capacity: usize, evict_buffer: usize, key_max: usize, default_ttl: u64) -> Self {
        Self {
            capacity,
            // The buffer is a reserve of free slots, not a fraction of the
            // table; cap it so small tables keep usable occupancy.
            evict_buffer: evict_buffer.clamp(1, (capacity / 2).max(1)),
            key_max,
            default_ttl,
            rows: HashMap::with_capacity(capacity),
            lru: VecDeque::with_capacity(capacity),
            seq: 0,
            stats: TableStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn stats(&self) -> TableStats {
        self.stats
    }

    /// Snapshot of live keys; used by version GC so the sweep never iterates
    /// the map while deleting from it.
    pub fn keys(&self) -> Vec<String> {
        self.rows.keys().cloned().collect()
    }

    /// TTL-aware read. An expired row is semantically absent: it is dropped
    /// here even though the GC has not reached it yet. A hit refreshes
    /// recency and usage.
    pub fn get(&mut self, key: &str) -> Option<TableRow> {
        let key = truncate_key(key, self.key_max);
        let now = now_secs();
        let expired = match self.rows.get(key) {
            Some(slot) => slot.row.expires_at <= now,
            None => {
                self.stats.misses += 1;
                return None;
            }
        };
        if expired {
            self.rows.remove(key);
            self.stats.misses += 1;
            self.stats.expired_drops += 1;
            return None;
        }

        self.seq += 1;
        let seq = self.seq;
        let slot = self.rows.get_mut(key)?;
        slot.row.last_access = now;
        slot.row.usage_count += 1;
        slot.seq = seq;
        let row = slot.row.clone();
        self.lru.push_back((key.to_string(), seq));
        self.stats.hits += 1;
        self.maybe_compact();
        Some(row)
    }

    /// Insert or overwrite. Inserting while free slots are down to the
    /// buffer reserve first drops a batch of exactly `evict_buffer` LRU
    /// entries, so the table always keeps headroom for the next burst.
    pub fn set(&mut self, key: &str, value: String, ttl: Option<u64>) -> Result<()> {
        let key = truncate_key(key, self.key_max).to_string();
        if !self.rows.contains_key(&key) {
            let free = self.capacity.saturating_sub(self.rows.len());
            if free <= self.evict_buffer {
                self.evict_lru(self.evict_buffer);
            }
            if self.rows.len() >= self.capacity {
                return Err(ServiceError::CacheFull(format!(
                    "no slot for {} after eviction",
                    key
                )));
            }
        }

        let now = now_secs();
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.seq += 1;
        let seq = self.seq;
        self.rows.insert(
            key.clone(),
            Slot {
                row: TableRow {
                    value,
                    created_at: now,
                    expires_at: now.saturating_add(ttl),
                    last_access: now,
                    usage_count: 0,
                },
                seq,
            },
        );
        self.lru.push_back((key, seq));
        self.maybe_compact();
        Ok(())
    }

    pub fn delete(&mut self, key: &str) -> bool {
        let key = truncate_key(key, self.key_max);
        self.rows.remove(key).is_some()
    }

    /// Atomic numeric update of a row's value. An absent row is created with
    /// default timestamps and a zero base.
    pub fn incr(&mut self, key: &str, delta: i64, ttl: Option<u64>) -> Result<i64> {
        let key = truncate_key(key, self.key_max);
        let now = now_secs();
        let live = self
            .rows
            .get(key)
            .map(|slot| slot.row.expires_at > now)
            .unwrap_or(false);
        if live {
            self.seq += 1;
            let seq = self.seq;
            let slot = match self.rows.get_mut(key) {
                Some(slot) => slot,
                None => return Err(ServiceError::Internal("row vanished during incr".into())),
            };
            let current: i64 = slot.row.value.trim().parse().map_err(|_| {
                ServiceError::Internal(format!("non-numeric value under {}", key))
            })?;
            let next = current.saturating_add(delta);
            slot.row.value = next.to_string();
            slot.row.last_access = now;
            slot.row.usage_count += 1;
            slot.seq = seq;
            self.lru.push_back((key.to_string(), seq));
            self.maybe_compact();
            Ok(next)
        } else {
            self.set(key, delta.to_string(), ttl)?;
            Ok(delta)
        }
    }

    /// Bounded-work sweep: examine up to `check_count` rows from the LRU head
    /// and drop the expired ones. Entries can expire out of LRU order, so
    /// every examined row is checked rather than stopping at the first live
    /// one. Keys are collected first, then removed.
    pub fn gc(&mut self, check_count: usize) -> usize {
        let now = now_secs();
        let mut examined = 0usize;
        let mut doomed: Vec<String> = Vec::new();
        for (key, seq) in self.lru.iter() {
            if examined >= check_count {
                break;
            }
            let Some(slot) = self.rows.get(key) else {
                continue;
            };
            if slot.seq != *seq {
                continue;
            }
            examined += 1;
            if slot.row.expires_at <= now {
                doomed.push(key.clone());
            }
        }
        let removed = doomed.len();
        for key in doomed {
            self.rows.remove(&key);
        }
        self.stats.expired_drops += removed as u64;
        self.drop_stale_head();
        removed
    }

    /// Drop up to `count` least-recently-used rows (stale stamps skipped).
    fn evict_lru(&mut self, count: usize) -> usize {
        let mut evicted = 0usize;
        while evicted < count {
            let Some((key, seq)) = self.lru.pop_front() else {
                break;
            };
            let live = self
                .rows
                .get(&key)
                .map(|slot| slot.seq == seq)
                .unwrap_or(false);
            if live {
                self.rows.remove(&key);
                evicted += 1;
            }
        }
        self.stats.evictions += evicted as u64;
        evicted
    }

    // Cheap housekeeping: shed stale stamps at the head, and rebuild the
    // queue when stale stamps dominate it.
    fn drop_stale_head(&mut self) {
        while let Some((key, seq)) = self.lru.front() {
            let live = self
                .rows
                .get(key)
                .map(|slot| slot.seq == *seq)
                .unwrap_or(false);
            if live {
                break;
            }
            self.lru.pop_front();
        }
    }

    fn maybe_compact(&mut self) {
        if self.lru.len() > self.rows.len().saturating_mul(2) + 64 {
            let rows = &self.rows;
            self.lru
                .retain(|(key, seq)| rows.get(key).map(|s| s.seq == *seq).unwrap_or(false));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(capacity: usize) -> BoundedTable {
        BoundedTable::new(capacity, 2, 56, 300)
    }

    #[test]
    fn test_set_get_roundtrip() {
        let mut t = table(8);
        t.set("users:record:id:1", "{\"id\":1}".into(), None).unwrap();
        let row = t.get("users:record:id:1").unwrap();
        assert_eq!(row.value, "{\"id\":1}");
        assert_eq!(row.usage_count, 1);
        assert!(row.expires_at > row.created_at);
    }

    #[test]
    fn test_expired_rows_are_absent() {
        let mut t = table(8);
        t.set("k", "v".into(), Some(0)).unwrap();
        assert_eq!(t.len(), 1);
        assert!(t.get("k").is_none());
        assert_eq!(t.len(), 0);
        assert_eq!(t.stats().expired_drops, 1);
    }

    #[test]
    fn test_lru_eviction_keeps_recently_touched() {
        let mut t = table(8);
        // Fill to the buffer reserve: six rows leave free slots == buffer.
        for i in 0..6 {
            t.set(&format!("k{}", i), i.to_string(), None).unwrap();
        }
        // Touch k0 and k1 so k2/k3 become the LRU victims.
        t.get("k0");
        t.get("k1");
        t.set("k6", "6".into(), None).unwrap();
        assert!(t.get("k2").is_none());
        assert!(t.get("k3").is_none());
        assert!(t.get("k0").is_some());
        assert!(t.get("k1").is_some());
        assert!(t.get("k6").is_some());
        assert_eq!(t.stats().evictions, 2);
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let mut t = table(8);
        for i in 0..6 {
            t.set(&format!("k{}", i), i.to_string(), None).unwrap();
        }
        t.set("k0", "fresh".into(), None).unwrap();
        assert_eq!(t.len(), 6);
        assert_eq!(t.stats().evictions, 0);
        assert_eq!(t.get("k0").unwrap().value, "fresh");
    }

    #[test]
    fn test_incr_creates_and_updates() {
        let mut t = table(8);
        assert_eq!(t.incr("users:version", 1, None).unwrap(), 1);
        assert_eq!(t.incr("users:version", 1, None).unwrap(), 2);
        assert_eq!(t.incr("users:version", 3, None).unwrap(), 5);
    }

    #[test]
    fn test_incr_rejects_non_numeric() {
        let mut t = table(8);
        t.set("k", "not a number".into(), None).unwrap();
        assert!(t.incr("k", 1, None).is_err());
    }

    #[test]
    fn test_gc_sweeps_expired_out_of_order() {
        let mut t = table(16);
        t.set("old-live", "v".into(), Some(600)).unwrap();
        t.set("dead1", "v".into(), Some(0)).unwrap();
        t.set("dead2", "v".into(), Some(0)).unwrap();
        t.set("young-live", "v".into(), Some(600)).unwrap();
        // The live head entry must not stop the sweep.
        let removed = t.gc(16);
        assert_eq!(removed, 2);
        assert_eq!(t.len(), 2);
        assert!(t.get("old-live").is_some());
        assert!(t.get("young-live").is_some());
    }

    #[test]
    fn test_gc_is_bounded() {
        let mut t = table(32);
        for i in 0..10 {
            t.set(&format!("dead{}", i), "v".into(), Some(0)).unwrap();
        }
        let removed = t.gc(4);
        assert_eq!(removed, 4);
        assert_eq!(t.len(), 6);
    }

    #[test]
    fn test_key_truncation_is_consistent() {
        let mut t = table(8);
        let long = "x".repeat(200);
        t.set(&long, "v".into(), None).unwrap();
        assert!(t.get(&long).is_some());
        assert!(t.get(&"x".repeat(56)).is_some());
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_delete() {
        let mut t = table(8);
        t.set("k", "v".into(), None).unwrap();
        assert!(t.delete("k"));
        assert!(!t.delete("k"));
        assert!(t.get("k").is_none());
    }
}
