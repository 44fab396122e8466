// Worker health table
//
// One row per live worker: pid, heartbeats, and pool gauges. The supervisor
// owns the table; the health endpoints read snapshots.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;

use crate::pool::PoolStats;

#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealthRow {
    pub worker_id: u64,
    pub pid: u32,
    pub first_heartbeat: u64,
    pub last_heartbeat: u64,
    pub sql_capacity: usize,
    pub sql_available: usize,
    pub sql_created: usize,
    pub sql_in_use: usize,
    pub kv_capacity: usize,
    pub kv_available: usize,
    pub kv_created: usize,
    pub kv_in_use: usize,
}

impl WorkerHealthRow {
    pub fn new(worker_id: u64, pid: u32, now: u64, sql: PoolStats, kv: PoolStats) -> Self {
        let mut row = Self {
            worker_id,
            pid,
            first_heartbeat: now,
            last_heartbeat: now,
            sql_capacity: 0,
            sql_available: 0,
            sql_created: 0,
            sql_in_use: 0,
            kv_capacity: 0,
            kv_available: 0,
            kv_created: 0,
            kv_in_use: 0,
        };
        row.record_gauges(now, sql, kv);
        row
    }

    pub fn record_gauges(&mut self, now: u64, sql: PoolStats, kv: PoolStats) {
        self.last_heartbeat = now;
        self.sql_capacity = sql.capacity;
        self.sql_available = sql.available;
        self.sql_created = sql.created;
        self.sql_in_use = sql.in_use;
        self.kv_capacity = kv.capacity;
        self.kv_available = kv.available;
        self.kv_created = kv.created;
        self.kv_in_use = kv.in_use;
    }
}

#[derive(Default)]
pub struct HealthTable {
    rows: RwLock<HashMap<u64, WorkerHealthRow>>,
}

impl HealthTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, row: WorkerHealthRow) {
        self.rows.write().insert(row.worker_id, row);
    }

    pub fn update<F: FnOnce(&mut WorkerHealthRow)>(&self, worker_id: u64, f: F) {
        if let Some(row) = self.rows.write().get_mut(&worker_id) {
            f(row);
        }
    }

    pub fn delete(&self, worker_id: u64) -> bool {
        self.rows.write().remove(&worker_id).is_some()
    }

    pub fn get(&self, worker_id: u64) -> Option<WorkerHealthRow> {
        self.rows.read().get(&worker_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<WorkerHealthRow> {
        let mut rows: Vec<_> = self.rows.read().values().cloned().collect();
        rows.sort_by_key(|row| row.worker_id);
        rows
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(created: usize, available: usize) -> PoolStats {
        PoolStats {
            capacity: 16,
            created,
            available,
            in_use: created - available,
        }
    }

    #[test]
    fn test_insert_update_delete() {
        let table = HealthTable::new();
        table.insert(WorkerHealthRow::new(1, 42, 100, stats(2, 2), stats(2, 1)));
        assert_eq!(table.len(), 1);

        table.update(1, |row| row.record_gauges(105, stats(4, 1), stats(2, 2)));
        let row = table.get(1).unwrap();
        assert_eq!(row.first_heartbeat, 100);
        assert_eq!(row.last_heartbeat, 105);
        assert_eq!(row.sql_created, 4);
        assert_eq!(row.sql_in_use, 3);

        assert!(table.delete(1));
        assert!(!table.delete(1));
        assert!(table.is_empty());
    }

    #[test]
    fn test_snapshot_is_ordered() {
        let table = HealthTable::new();
        table.insert(WorkerHealthRow::new(3, 1, 1, stats(1, 1), stats(1, 1)));
        table.insert(WorkerHealthRow::new(1, 1, 1, stats(1, 1), stats(1, 1)));
        let ids: Vec<u64> = table.snapshot().iter().map(|r| r.worker_id).collect();
        assert_eq!(ids, vec![1, 3]);
    }
}
