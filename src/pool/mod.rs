// # Connection Pooling
//
// Bounded, auto-scaling pools for the SQL and KV backends. Both are
// instances of the same generic `ConnectionPool` over a `Connector`; the
// connectors own driver specifics. Checkout is reentrant per task: the id
// installed by the request middleware (a scheduler-aware task-local, never
// bare thread-local storage) keys a depth-counted lease so nested scopes on
// one request share a single connection.

pub mod kv;
pub mod manager;
pub mod retry;
pub mod sql;

pub use kv::{KvConn, KvConnector, KvPool};
pub use manager::{ConnectionPool, Connector, PoolState, PoolStats};
pub use retry::{retry_with_backoff, DuplicateKeyInfo};
pub use sql::{SqlConn, SqlConnector, SqlPool};

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

tokio::task_local! {
    static TASK_ID: u64;
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh task id. Ids are process-unique and monotonic.
pub fn next_task_id() -> u64 {
    NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
}

/// Run `fut` with `task_id` installed as the current task's identity.
pub async fn with_task_scope<F: Future>(task_id: u64, fut: F) -> F::Output {
    TASK_ID.scope(task_id, fut).await
}

/// The current task's id, if a scope is installed.
pub fn current_task_id() -> Option<u64> {
    TASK_ID.try_with(|id| *id).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_task_scope_installs_id() {
        assert_eq!(current_task_id(), None);
        let id = next_task_id();
        let seen = with_task_scope(id, async { current_task_id() }).await;
        assert_eq!(seen, Some(id));
        assert_eq!(current_task_id(), None);
    }

    #[tokio::test]
    async fn test_task_ids_are_unique() {
        let a = next_task_id();
        let b = next_task_id();
        assert_ne!(a, b);
    }
}
