// Worker supervisor
//
// Brings one worker up (pools first, readiness last), keeps its health row
// current, and drives the periodic auto-scale and cache GC ticks. Teardown
// is idempotent: stop/exit/error all funnel into one guarded path that
// cancels the tickers, deletes the health row and clears readiness.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::cache::{now_secs, TwoTierCache};
use crate::error::Result;
use crate::pool::{KvPool, SqlPool};
use crate::worker::health::{HealthTable, WorkerHealthRow};
use crate::worker::{AUTOSCALE_INTERVAL, GC_INTERVAL, HEARTBEAT_INTERVAL};

pub struct WorkerSupervisor {
    worker_id: u64,
    sql_pool: Arc<SqlPool>,
    kv_pool: Arc<KvPool>,
    cache: Arc<TwoTierCache>,
    health: Arc<HealthTable>,
    ready: Arc<AtomicBool>,
    tickers: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl WorkerSupervisor {
    pub fn new(
        worker_id: u64,
        sql_pool: Arc<SqlPool>,
        kv_pool: Arc<KvPool>,
        cache: Arc<TwoTierCache>,
        health: Arc<HealthTable>,
    ) -> Arc<Self> {
        Arc::new(Self {
            worker_id,
            sql_pool,
            kv_pool,
            cache,
            health,
            ready: Arc::new(AtomicBool::new(false)),
            tickers: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }

    /// Readiness flag consumed by the request-entry gate.
    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.ready)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Initialize pools (retrying connect forever: the worker must not come
    /// up READY before its backends), insert the health row, start tickers,
    /// then flip readiness.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.sql_pool.init(-1).await?;
        self.kv_pool.init(-1).await?;

        let now = now_secs();
        self.health.insert(WorkerHealthRow::new(
            self.worker_id,
            std::process::id(),
            now,
            self.sql_pool.stats(),
            self.kv_pool.stats(),
        ));

        let mut tickers = self.tickers.lock();
        tickers.push(self.spawn_heartbeat());
        tickers.push(self.spawn_autoscale());
        tickers.push(self.spawn_gc());
        drop(tickers);

        self.ready.store(true, Ordering::SeqCst);
        tracing::info!(worker_id = self.worker_id, "worker ready");
        Ok(())
    }

    /// Idempotent teardown: multiple lifecycle events collapse to one.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ready.store(false, Ordering::SeqCst);
        for ticker in self.tickers.lock().drain(..) {
            ticker.abort();
        }
        self.health.delete(self.worker_id);
        self.sql_pool.close();
        self.kv_pool.close();
        tracing::info!(worker_id = self.worker_id, "worker stopped");
    }

    fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tick.tick().await;
                let sql = supervisor.sql_pool.stats();
                let kv = supervisor.kv_pool.stats();
                supervisor.health.update(supervisor.worker_id, |row| {
                    row.record_gauges(now_secs(), sql, kv);
                });
            }
        })
    }

    fn spawn_autoscale(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(AUTOSCALE_INTERVAL);
            loop {
                tick.tick().await;
                if let Err(err) = supervisor.sql_pool.auto_scale().await {
                    tracing::warn!(pool = "sql", error = %err, "auto-scale tick failed");
                }
                if let Err(err) = supervisor.kv_pool.auto_scale().await {
                    tracing::warn!(pool = "kv", error = %err, "auto-scale tick failed");
                }
            }
        })
    }

    fn spawn_gc(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(GC_INTERVAL);
            loop {
                tick.tick().await;
                match supervisor.cache.gc().await {
                    Ok(removed) if removed > 0 => {
                        tracing::debug!(removed, "cache GC tick")
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "cache GC tick failed"),
                }
            }
        })
    }
}

impl Drop for WorkerSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}
