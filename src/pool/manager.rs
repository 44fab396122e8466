// Bounded connection pool
//
// Checkout order is channel FIFO, except that the hot path creates a fresh
// connection (bypassing the channel) whenever the idle reserve runs down to
// one and the pool is below max. Dead connections never surface to callers:
// every checkout probes liveness and transparently replaces casualties.
//
// Reentrancy: a task that already holds a connection reuses it on nested
// checkout (depth-counted lease keyed by task id), which is what makes
// nested transactional scopes share one session. Lease teardown runs from a
// drop guard so cancelled tasks cannot leak a connection.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::config::PoolSettings;
use crate::error::{Result, ServiceError};
use crate::pool::retry::{self, DuplicateKeyInfo};
use crate::pool::{current_task_id, next_task_id};

/// Factory and health policy for one kind of pooled connection.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Send + Sync + 'static;

    /// Establish a new connection.
    async fn connect(&self) -> Result<Self::Conn>;

    /// Active liveness probe, run at checkout.
    async fn is_valid(&self, conn: &Self::Conn) -> bool;

    /// Cheap passive check, run at release. `true` means discard.
    fn has_broken(&self, conn: &Self::Conn) -> bool;

    /// Dispose of a connection. Both drivers close on drop.
    fn close(&self, conn: Self::Conn) {
        drop(conn);
    }
}

/// Pool lifecycle. `acquire` is permitted only in `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolState {
    Uninitialized = 0,
    Initializing = 1,
    Ready = 2,
    Draining = 3,
    Closed = 4,
}

impl PoolState {
    fn from_u8(value: u8) -> PoolState {
        match value {
            1 => PoolState::Initializing,
            2 => PoolState::Ready,
            3 => PoolState::Draining,
            4 => PoolState::Closed,
            _ => PoolState::Uninitialized,
        }
    }
}

/// Point-in-time pool gauges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub created: usize,
    pub available: usize,
    pub in_use: usize,
}

struct Lease<T> {
    conn: Arc<T>,
    depth: u32,
}

pub struct ConnectionPool<C: Connector> {
    name: &'static str,
    settings: PoolSettings,
    connector: C,
    idle: Mutex<VecDeque<C::Conn>>,
    idle_permits: Semaphore,
    created: AtomicUsize,
    state: AtomicU8,
    leases: DashMap<u64, Lease<C::Conn>>,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(name: &'static str, settings: PoolSettings, connector: C) -> Self {
        let capacity = settings.max;
        Self {
            name,
            settings,
            connector,
            idle: Mutex::new(VecDeque::with_capacity(capacity)),
            idle_permits: Semaphore::new(0),
            created: AtomicUsize::new(0),
            state: AtomicU8::new(PoolState::Uninitialized as u8),
            leases: DashMap::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_ready(&self) -> bool {
        self.state() == PoolState::Ready
    }

    pub fn stats(&self) -> PoolStats {
        let created = self.created.load(Ordering::SeqCst);
        let available = self.idle_permits.available_permits();
        PoolStats {
            capacity: self.settings.max,
            created,
            available,
            in_use: created.saturating_sub(available),
        }
    }

    /// Create the first `min` connections and open the pool. `max_retries`
    /// follows the retry engine contract (-1 retries forever): a worker must
    /// not come up READY until its pools are.
    pub async fn init(&self, max_retries: i32) -> Result<()> {
        match self.state.compare_exchange(
            PoolState::Uninitialized as u8,
            PoolState::Initializing as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(_) if self.state() == PoolState::Ready => return Ok(()),
            Err(_) => {
                return Err(ServiceError::Internal(format!(
                    "{} pool: init called in state {:?}",
                    self.name,
                    self.state()
                )))
            }
        }

        for _ in 0..self.settings.min {
            let conn = match retry::retry_with_backoff(
                max_retries,
                self.settings.retry_base_delay(),
                retry::should_retry,
                |_attempt| self.connector.connect(),
            )
            .await
            {
                Ok(conn) => conn,
                Err(err) => {
                    self.state
                        .store(PoolState::Uninitialized as u8, Ordering::SeqCst);
                    return Err(err);
                }
            };
            self.created.fetch_add(1, Ordering::SeqCst);
            self.idle.lock().push_back(conn);
            self.idle_permits.add_permits(1);
        }

        self.state.store(PoolState::Ready as u8, Ordering::SeqCst);
        tracing::info!(pool = self.name, min = self.settings.min, max = self.settings.max, "pool ready");
        Ok(())
    }

    /// Check a connection out of the pool, waiting at most `timeout` for an
    /// idle one. Ownership passes to the caller; pair with `release`.
    pub async fn acquire(&self, timeout: Duration) -> Result<C::Conn> {
        match self.state() {
            PoolState::Ready => {}
            PoolState::Uninitialized | PoolState::Initializing => {
                return Err(ServiceError::PoolNotInitialized)
            }
            _ => return Err(ServiceError::PoolClosed),
        }

        // Hot-path scale-up: keep one idle connection of headroom.
        if self.idle_permits.available_permits() <= 1 {
            if let Some(conn) = self.try_grow().await? {
                return Ok(conn);
            }
        }

        let permit = match tokio::time::timeout(timeout, self.idle_permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ServiceError::PoolClosed),
            Err(_) => {
                let stats = self.stats();
                return Err(ServiceError::PoolExhausted {
                    in_use: stats.in_use,
                    max: stats.capacity,
                    waited_ms: timeout.as_millis() as u64,
                });
            }
        };
        permit.forget();

        let conn = match self.idle.lock().pop_front() {
            Some(conn) => conn,
            None => {
                return Err(ServiceError::Internal(format!(
                    "{} pool: idle queue out of sync with permits",
                    self.name
                )))
            }
        };

        if !self.connector.has_broken(&conn) && self.connector.is_valid(&conn).await {
            return Ok(conn);
        }

        // Dead connection: discard and heal in place.
        tracing::warn!(pool = self.name, "discarding dead idle connection");
        self.created.fetch_sub(1, Ordering::SeqCst);
        self.connector.close(conn);
        match self.try_grow().await? {
            Some(conn) => Ok(conn),
            None => {
                let stats = self.stats();
                Err(ServiceError::PoolExhausted {
                    in_use: stats.in_use,
                    max: stats.capacity,
                    waited_ms: 0,
                })
            }
        }
    }

    /// Return a connection. Healthy ones rejoin the channel; broken ones are
    /// closed and uncounted.
    pub fn release(&self, conn: C::Conn) {
        if !self.connector.has_broken(&conn) && self.state() == PoolState::Ready {
            let mut idle = self.idle.lock();
            if idle.len() < self.settings.max {
                idle.push_back(conn);
                drop(idle);
                self.idle_permits.add_permits(1);
                return;
            }
        }
        self.created.fetch_sub(1, Ordering::SeqCst);
        self.connector.close(conn);
    }

    /// Run `f` with this task's connection, checking one out if the task does
    /// not hold one yet. Nested calls on the same task share the connection.
    pub async fn with_connection<F, Fut, R>(self: &Arc<Self>, f: F) -> Result<R>
    where
        F: FnOnce(Arc<C::Conn>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let task_id = current_task_id().unwrap_or_else(next_task_id);
        let conn = self.lease(task_id).await?;
        let _guard = LeaseGuard {
            pool: Arc::clone(self),
            task_id,
        };
        f(conn).await
    }

    /// `with_connection` wrapped in the generic retry predicate.
    pub async fn with_connection_retry<F, Fut, R>(self: &Arc<Self>, f: F) -> Result<R>
    where
        F: Fn(Arc<C::Conn>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        retry::retry_with_backoff(
            self.settings.max_retries,
            self.settings.retry_base_delay(),
            retry::should_retry,
            |_attempt| self.with_connection(|conn| f(conn)),
        )
        .await
    }

    /// Create-path retry: transient errors back off as usual; a duplicate-key
    /// error on a retry attempt is handed to `on_duplicate`, which may resolve
    /// it to the previously inserted row (our own first attempt landed).
    pub async fn with_connection_retry_for_create<F, Fut, R, D, DFut>(
        self: &Arc<Self>,
        f: F,
        on_duplicate: D,
    ) -> Result<R>
    where
        F: Fn(Arc<C::Conn>) -> Fut,
        Fut: Future<Output = Result<R>>,
        D: Fn(DuplicateKeyInfo) -> DFut,
        DFut: Future<Output = Result<Option<R>>>,
    {
        let max_retry = self.settings.max_retries;
        let mut attempt: u32 = 0;
        loop {
            match self.with_connection(|conn| f(conn)).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if retry::is_duplicate_key(&err) {
                        let info = retry::parse_duplicate_key(&err);
                        if attempt > 0 {
                            if let Some(info) = info.clone() {
                                if let Some(value) = on_duplicate(info).await? {
                                    return Ok(value);
                                }
                            }
                        }
                        return Err(match info {
                            Some(info) => ServiceError::DuplicateKey {
                                table: info.table,
                                column: info.column,
                                value: info.value,
                            },
                            None => err,
                        });
                    }
                    if !retry::should_retry(&err)
                        || (max_retry >= 0 && attempt as i32 >= max_retry)
                    {
                        return Err(err);
                    }
                    tokio::time::sleep(retry::backoff_delay(
                        self.settings.retry_base_delay(),
                        attempt,
                    ))
                    .await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// Periodic right-sizing between `min` and `max` around the configured
    /// idle buffer. The hot path already handles latency spikes; this tick
    /// only corrects steady-state drift, and slot reservation guarantees the
    /// two can never over-create together.
    pub async fn auto_scale(&self) -> Result<()> {
        if self.state() != PoolState::Ready {
            return Ok(());
        }

        let idle = self.idle_permits.available_permits() as f64;
        let idle_buffer_count = self.settings.max as f64 * self.settings.idle_buffer;
        let upper = idle_buffer_count * (1.0 + self.settings.margin);
        let lower = f64::min(
            self.settings.min as f64,
            idle_buffer_count * (1.0 - self.settings.margin),
        );

        if idle < lower {
            let deficit = (lower - idle).ceil() as usize;
            for _ in 0..deficit {
                match self.try_grow().await? {
                    Some(conn) => {
                        self.idle.lock().push_back(conn);
                        self.idle_permits.add_permits(1);
                    }
                    None => break,
                }
            }
        } else if idle > upper {
            let excess = (idle - upper).floor() as usize;
            for _ in 0..excess {
                if self.created.load(Ordering::SeqCst) <= self.settings.min {
                    break;
                }
                // Near-zero timeout: only reap connections nobody is waiting on.
                let permit = match self.idle_permits.try_acquire() {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                permit.forget();
                let conn = self.idle.lock().pop_front();
                match conn {
                    Some(conn) => {
                        self.created.fetch_sub(1, Ordering::SeqCst);
                        self.connector.close(conn);
                    }
                    None => break,
                }
            }
        }
        Ok(())
    }

    /// Drain and close. Idempotent; outstanding leases are discarded as their
    /// guards drop (release refuses to requeue once the pool left READY).
    pub fn close(&self) {
        let previous = self.state.swap(PoolState::Draining as u8, Ordering::SeqCst);
        if previous == PoolState::Closed as u8 {
            self.state.store(PoolState::Closed as u8, Ordering::SeqCst);
            return;
        }
        self.idle_permits.close();
        loop {
            let conn = self.idle.lock().pop_front();
            match conn {
                Some(conn) => {
                    self.created.fetch_sub(1, Ordering::SeqCst);
                    self.connector.close(conn);
                }
                None => break,
            }
        }
        self.state.store(PoolState::Closed as u8, Ordering::SeqCst);
        tracing::info!(pool = self.name, "pool closed");
    }

    /// Reserve a `created` slot and connect, bypassing the channel. Returns
    /// `Ok(None)` when the pool is already at max.
    async fn try_grow(&self) -> Result<Option<C::Conn>> {
        if !self.try_reserve_slot() {
            return Ok(None);
        }
        let mut reservation = SlotReservation {
            pool: self,
            armed: true,
        };
        let conn = retry::retry_with_backoff(
            self.settings.max_retries,
            self.settings.retry_base_delay(),
            retry::should_retry,
            |_attempt| self.connector.connect(),
        )
        .await?;
        reservation.armed = false;
        Ok(Some(conn))
    }

    fn try_reserve_slot(&self) -> bool {
        let mut current = self.created.load(Ordering::SeqCst);
        while current < self.settings.max {
            match self.created.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    async fn lease(&self, task_id: u64) -> Result<Arc<C::Conn>> {
        let existing = self.leases.get_mut(&task_id).map(|mut lease| {
            lease.depth += 1;
            Arc::clone(&lease.conn)
        });

        let conn = match existing {
            Some(conn) => conn,
            None => {
                let fresh = Arc::new(self.acquire(self.settings.acquire_timeout()).await?);
                self.leases.insert(
                    task_id,
                    Lease {
                        conn: Arc::clone(&fresh),
                        depth: 1,
                    },
                );
                return Ok(fresh);
            }
        };

        if !self.connector.has_broken(&conn) && self.connector.is_valid(&conn).await {
            return Ok(conn);
        }

        // The shared connection died between nested scopes: discard it and
        // swap a fresh one into the lease. Outer scopes keep their stale
        // handle and will fail on next use, which the retry layer absorbs.
        tracing::warn!(pool = self.name, task_id, "replacing dead leased connection");
        self.created.fetch_sub(1, Ordering::SeqCst);
        drop(conn);
        match self.try_grow().await {
            Ok(Some(fresh)) => {
                let fresh = Arc::new(fresh);
                if let Some(mut lease) = self.leases.get_mut(&task_id) {
                    lease.conn = Arc::clone(&fresh);
                }
                Ok(fresh)
            }
            Ok(None) => {
                self.leases.remove(&task_id);
                let stats = self.stats();
                Err(ServiceError::PoolExhausted {
                    in_use: stats.in_use,
                    max: stats.capacity,
                    waited_ms: 0,
                })
            }
            Err(err) => {
                self.leases.remove(&task_id);
                Err(err)
            }
        }
    }

    fn release_lease(&self, task_id: u64) {
        let done = match self.leases.get_mut(&task_id) {
            Some(mut lease) => {
                lease.depth -= 1;
                lease.depth == 0
            }
            None => false,
        };
        if !done {
            return;
        }
        if let Some((_, lease)) = self.leases.remove(&task_id) {
            match Arc::try_unwrap(lease.conn) {
                Ok(conn) => self.release(conn),
                // A caller kept a clone past its scope; refuse to requeue a
                // connection that may still be used.
                Err(_) => {
                    tracing::warn!(pool = self.name, task_id, "leaked connection handle, discarding");
                    self.created.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
    }
}

struct LeaseGuard<C: Connector> {
    pool: Arc<ConnectionPool<C>>,
    task_id: u64,
}

impl<C: Connector> Drop for LeaseGuard<C> {
    fn drop(&mut self) {
        self.pool.release_lease(self.task_id);
    }
}

struct SlotReservation<'a, C: Connector> {
    pool: &'a ConnectionPool<C>,
    armed: bool,
}

impl<C: Connector> Drop for SlotReservation<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.created.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
