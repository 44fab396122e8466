// Pool behavior against a mock connector: conservation, burst auto-scale,
// reentrancy, transparent healing, and the create-retry duplicate branch.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use swift_crud::config::PoolSettings;
use swift_crud::error::{Result, ServiceError};
use swift_crud::pool::{self, ConnectionPool, Connector, PoolState};

#[derive(Debug)]
struct MockConn {
    id: u64,
    dead: AtomicBool,
}

struct MockConnector {
    next_id: AtomicU64,
    fail_next: AtomicUsize,
    // Connection ids that died while sitting in the pool.
    graveyard: Arc<std::sync::Mutex<std::collections::HashSet<u64>>>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            fail_next: AtomicUsize::new(0),
            graveyard: Arc::new(std::sync::Mutex::new(std::collections::HashSet::new())),
        }
    }
}

impl MockConnector {
    fn buried(&self, id: u64) -> bool {
        self.graveyard.lock().unwrap().contains(&id)
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Conn = MockConn;

    async fn connect(&self) -> Result<MockConn> {
        if self.fail_next.load(Ordering::SeqCst) > 0 {
            self.fail_next.fetch_sub(1, Ordering::SeqCst);
            return Err(ServiceError::CreateFailed("connection refused".into()));
        }
        Ok(MockConn {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            dead: AtomicBool::new(false),
        })
    }

    async fn is_valid(&self, conn: &MockConn) -> bool {
        !conn.dead.load(Ordering::SeqCst) && !self.buried(conn.id)
    }

    fn has_broken(&self, conn: &MockConn) -> bool {
        conn.dead.load(Ordering::SeqCst) || self.buried(conn.id)
    }
}

fn settings(min: usize, max: usize) -> PoolSettings {
    PoolSettings {
        min,
        max,
        idle_buffer: 0.1,
        margin: 0.1,
        acquire_timeout_ms: 1_000,
        max_retries: 3,
        retry_base_delay_ms: 1,
    }
}

fn pool(min: usize, max: usize) -> Arc<ConnectionPool<MockConnector>> {
    Arc::new(ConnectionPool::new(
        "mock",
        settings(min, max),
        MockConnector::default(),
    ))
}

#[tokio::test]
async fn test_init_creates_min_connections() {
    let p = pool(3, 8);
    assert_eq!(p.state(), PoolState::Uninitialized);
    p.init(3).await.unwrap();
    assert_eq!(p.state(), PoolState::Ready);

    let stats = p.stats();
    assert_eq!(stats.created, 3);
    assert_eq!(stats.available, 3);
    assert_eq!(stats.in_use, 0);
}

#[tokio::test]
async fn test_acquire_before_init_fails() {
    let p = pool(2, 4);
    let err = p.acquire(Duration::from_millis(10)).await.unwrap_err();
    assert!(matches!(err, ServiceError::PoolNotInitialized));
}

#[tokio::test]
async fn test_init_retries_transient_failures() {
    // Two refused connects before the first success; the retry budget
    // absorbs them and the pool still comes up with min connections.
    let connector = MockConnector::default();
    connector.fail_next.store(2, Ordering::SeqCst);
    let p = Arc::new(ConnectionPool::new("mock", settings(2, 4), connector));
    p.init(5).await.unwrap();
    assert_eq!(p.state(), PoolState::Ready);
    assert_eq!(p.stats().created, 2);
}

#[tokio::test]
async fn test_init_fails_when_budget_exhausted() {
    let connector = MockConnector::default();
    connector.fail_next.store(10, Ordering::SeqCst);
    let p = Arc::new(ConnectionPool::new("mock", settings(2, 4), connector));
    assert!(p.init(2).await.is_err());
    assert_eq!(p.state(), PoolState::Uninitialized);
}

#[tokio::test]
async fn test_conservation_under_concurrent_checkout() {
    let p = pool(2, 6);
    p.init(3).await.unwrap();

    let tasks: Vec<_> = (0..24)
        .map(|_| {
            let p = Arc::clone(&p);
            async move {
                pool::with_task_scope(pool::next_task_id(), async move {
                    p.with_connection(|_conn| async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok(())
                    })
                    .await
                })
                .await
            }
        })
        .collect();
    let results = futures::future::join_all(tasks).await;
    assert!(results.iter().all(|r| r.is_ok()));

    let stats = p.stats();
    assert!(stats.created <= 6);
    assert_eq!(stats.in_use, 0, "all connections must be back in the channel");
    assert_eq!(stats.created, stats.available);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_burst_scales_to_max_without_exhaustion() {
    // min=2, max=10: 20 concurrent holders of 200ms each must drive the
    // pool to max without any EXHAUSTED and finish within the 1s timeout.
    let p = pool(2, 10);
    p.init(3).await.unwrap();

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let p = Arc::clone(&p);
            async move {
                pool::with_task_scope(pool::next_task_id(), async move {
                    p.with_connection(|_conn| async move {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok(())
                    })
                    .await
                })
                .await
            }
        })
        .collect();
    let results = futures::future::join_all(tasks).await;
    assert!(
        results.iter().all(|r| r.is_ok()),
        "no task may observe EXHAUSTED during the burst"
    );

    let stats = p.stats();
    assert_eq!(stats.created, 10, "burst demand must scale the pool to max");
    assert_eq!(stats.created, stats.available);
}

#[tokio::test]
async fn test_exhausted_when_at_max_and_busy() {
    let p = pool(1, 1);
    p.init(1).await.unwrap();

    let held = p.acquire(Duration::from_millis(50)).await.unwrap();
    let err = p.acquire(Duration::from_millis(50)).await.unwrap_err();
    assert!(matches!(err, ServiceError::PoolExhausted { .. }));

    p.release(held);
    let again = p.acquire(Duration::from_millis(50)).await.unwrap();
    p.release(again);
}

#[tokio::test]
async fn test_checkout_is_fifo() {
    // A full pool cannot take the hot-path bypass, so checkout order is
    // exactly channel pop order.
    let p = pool(3, 3);
    p.init(1).await.unwrap();

    let a = p.acquire(Duration::from_millis(100)).await.unwrap();
    let b = p.acquire(Duration::from_millis(100)).await.unwrap();
    let c = p.acquire(Duration::from_millis(100)).await.unwrap();
    let ids = [a.id, b.id, c.id];
    p.release(a);
    p.release(b);
    p.release(c);

    // Hold each until the end so pops keep coming in release order.
    let mut reacquired = Vec::new();
    for expected in ids {
        let conn = p.acquire(Duration::from_millis(100)).await.unwrap();
        assert_eq!(conn.id, expected);
        reacquired.push(conn);
    }
    for conn in reacquired {
        p.release(conn);
    }
}

#[tokio::test]
async fn test_broken_connection_discarded_on_release() {
    let p = pool(2, 4);
    p.init(1).await.unwrap();

    let conn = p.acquire(Duration::from_millis(100)).await.unwrap();
    let doomed = conn.id;
    conn.dead.store(true, Ordering::SeqCst);
    p.release(conn); // broken: closed and uncounted

    let stats = p.stats();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.available, 1);

    let fresh = p.acquire(Duration::from_millis(100)).await.unwrap();
    assert_ne!(fresh.id, doomed);
    p.release(fresh);
}

#[tokio::test]
async fn test_dead_idle_connection_is_healed_on_checkout() {
    // A connection that dies while idle must never surface: checkout probes
    // it, discards it, and hands back a fresh replacement.
    let connector = MockConnector::default();
    let graveyard = Arc::clone(&connector.graveyard);
    let p = Arc::new(ConnectionPool::new("mock", settings(2, 4), connector));
    p.init(1).await.unwrap();

    // Both idle connections die in place (ids 1 and 2).
    graveyard.lock().unwrap().extend([1u64, 2u64]);

    let conn = p.acquire(Duration::from_millis(100)).await.unwrap();
    assert!(conn.id > 2, "checkout must heal past the dead idles");
    p.release(conn);

    let stats = p.stats();
    assert_eq!(stats.created, stats.available + stats.in_use);
    assert!(stats.created <= 4);
}

#[tokio::test]
async fn test_reentrant_checkout_shares_connection() {
    let p = pool(2, 4);
    p.init(1).await.unwrap();

    let p2 = Arc::clone(&p);
    pool::with_task_scope(pool::next_task_id(), async move {
        p2.with_connection(|outer| {
            let p3 = Arc::clone(&p2);
            async move {
                let outer_id = outer.id;
                // In-use accounting counts the task once, not per depth.
                assert_eq!(p3.stats().in_use, 1);
                p3.with_connection(|inner| async move {
                    assert_eq!(inner.id, outer_id, "nested scope must reuse the lease");
                    Ok(())
                })
                .await?;
                // Still held after the nested scope exits.
                assert_eq!(p3.stats().in_use, 1);
                Ok(())
            }
        })
        .await
    })
    .await
    .unwrap();

    let stats = p.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.created, stats.available);
}

#[tokio::test]
async fn test_tasks_without_scope_get_distinct_leases() {
    let p = pool(2, 4);
    p.init(1).await.unwrap();

    let p2 = Arc::clone(&p);
    p.with_connection(|a| {
        let p3 = Arc::clone(&p2);
        async move {
            let a_id = a.id;
            p3.with_connection(|b| async move {
                // No shared scope installed: two independent leases.
                assert_ne!(a_id, b.id);
                Ok(())
            })
            .await
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_auto_scale_up_and_down() {
    // idle_buffer 0.4 of max 10: buffer count 4, lower bound
    // min(min, 4*0.9) = 2, upper bound 4*1.1 = 4.4.
    let settings = PoolSettings {
        min: 2,
        max: 10,
        idle_buffer: 0.4,
        margin: 0.1,
        acquire_timeout_ms: 1_000,
        max_retries: 3,
        retry_base_delay_ms: 1,
    };
    let p = Arc::new(ConnectionPool::new(
        "mock",
        settings,
        MockConnector::default(),
    ));
    p.init(1).await.unwrap();

    // Drop idle to 1: below the lower bound of 2.
    let a = p.acquire(Duration::from_millis(100)).await.unwrap();
    assert_eq!(p.stats().available, 1);
    p.auto_scale().await.unwrap();
    let grown = p.stats();
    assert_eq!(grown.created, 3, "deficit of one must be created");
    assert_eq!(grown.available, 2);

    // Pump created up through the hot path, then idle everything.
    let mut held = vec![a];
    for _ in 0..4 {
        held.push(p.acquire(Duration::from_millis(100)).await.unwrap());
    }
    let created = p.stats().created;
    for conn in held {
        p.release(conn);
    }
    assert_eq!(p.stats().available, created);
    assert!(created as f64 > 4.4, "enough idle to sit above the upper bound");

    // Idle now exceeds upper: excess is reaped, then the pool settles just
    // above the buffer and never dips under min.
    p.auto_scale().await.unwrap();
    let shrunk = p.stats();
    assert!(shrunk.created < created);
    assert!(shrunk.created >= 2);
    assert_eq!(shrunk.created, shrunk.available);

    let settled = shrunk.created;
    p.auto_scale().await.unwrap();
    let again = p.stats();
    assert!(again.created <= settled);
    assert!(again.created >= 2);
}

#[tokio::test]
async fn test_create_retry_surfaces_first_attempt_duplicate() {
    let p = pool(1, 2);
    p.init(1).await.unwrap();

    let result: Result<i64> = p
        .with_connection_retry_for_create(
            |_conn| async move {
                Err(ServiceError::QueryFailed(
                    "Duplicate entry 'a@b' for key 'users.email'".into(),
                ))
            },
            |_info| async move { Ok(Some(7)) },
        )
        .await;
    // First-attempt duplicates are genuine conflicts, not our own retry echo.
    match result.unwrap_err() {
        ServiceError::DuplicateKey {
            table,
            column,
            value,
        } => {
            assert_eq!(table, "users");
            assert_eq!(column, "email");
            assert_eq!(value, "a@b");
        }
        other => panic!("expected DuplicateKey, got {:?}", other),
    }
}

#[tokio::test]
async fn test_create_retry_resolves_duplicate_after_transient() {
    let p = pool(1, 2);
    p.init(1).await.unwrap();

    let attempts = Arc::new(AtomicU32::new(0));
    let attempts2 = Arc::clone(&attempts);
    let result: Result<i64> = p
        .with_connection_retry_for_create(
            move |_conn| {
                let attempts = Arc::clone(&attempts2);
                async move {
                    // The first attempt "succeeded" server-side but the reply
                    // was lost as a transient; the retry then collides with
                    // our own insert.
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(ServiceError::QueryFailed("lost connection".into()))
                    } else {
                        Err(ServiceError::QueryFailed(
                            "Duplicate entry 'a@b' for key 'users.email'".into(),
                        ))
                    }
                }
            },
            |info| async move {
                assert_eq!(info.column, "email");
                assert_eq!(info.value, "a@b");
                Ok(Some(42))
            },
        )
        .await;
    assert_eq!(result.unwrap(), 42);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_close_rejects_new_checkouts() {
    let p = pool(1, 2);
    p.init(1).await.unwrap();
    p.close();
    assert_eq!(p.state(), PoolState::Closed);
    let err = p.acquire(Duration::from_millis(10)).await.unwrap_err();
    assert!(matches!(err, ServiceError::PoolClosed));
    assert_eq!(p.stats().created, 0);
}
