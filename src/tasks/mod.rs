// # Background Task Queue
//
// Fire-and-forget work posted from the request path: cache invalidations
// for secondary record keys, request metrics, and audit persistence. Tasks
// are tagged structs behind one single-method trait; the consumer loop runs
// each task under its own task scope and logs failures instead of
// propagating them.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::TwoTierCache;
use crate::error::Result;
use crate::pool::SqlPool;

/// Shared handles every task runs against.
pub struct TaskContext {
    pub cache: Arc<TwoTierCache>,
    pub sql: Arc<SqlPool>,
}

#[async_trait]
pub trait BackgroundTask: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    async fn handle(&self, id: u64, ctx: &TaskContext) -> Result<()>;
}

#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<Box<dyn BackgroundTask>>,
}

impl TaskQueue {
    /// Spawn the consumer loop and hand back the posting side.
    pub fn start(ctx: TaskContext) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Box<dyn BackgroundTask>>();
        let worker = tokio::spawn(async move {
            let mut next_id: u64 = 1;
            while let Some(task) = rx.recv().await {
                let id = next_id;
                next_id += 1;
                let scope = crate::pool::next_task_id();
                let result =
                    crate::pool::with_task_scope(scope, task.handle(id, &ctx)).await;
                match result {
                    Ok(()) => {
                        tracing::debug!(task = task.name(), id, "background task done")
                    }
                    Err(err) => {
                        tracing::warn!(task = task.name(), id, error = %err, "background task failed")
                    }
                }
            }
            tracing::debug!("task queue drained, consumer exiting");
        });
        (Self { tx }, worker)
    }

    /// Post a task. Returns false when the consumer is gone; callers treat
    /// that as a skip, never an error.
    pub fn dispatch<T: BackgroundTask>(&self, task: T) -> bool {
        self.tx.send(Box::new(task)).is_ok()
    }
}

/// Drop a record's secondary-column cache entry in both tiers (the request
/// path invalidates the primary key inline).
pub struct InvalidateRecordTask {
    pub entity: &'static str,
    pub column: &'static str,
    pub value: String,
}

#[async_trait]
impl BackgroundTask for InvalidateRecordTask {
    fn name(&self) -> &'static str {
        "invalidate_record"
    }

    async fn handle(&self, _id: u64, ctx: &TaskContext) -> Result<()> {
        ctx.cache
            .invalidate_record(self.entity, self.column, &self.value)
            .await
    }
}

/// Bump the per-endpoint request counter in both tiers.
pub struct RecordMetricTask {
    pub endpoint: String,
}

/// Counters roll over daily.
const METRIC_TTL_SECS: u64 = 86_400;

#[async_trait]
impl BackgroundTask for RecordMetricTask {
    fn name(&self) -> &'static str {
        "record_metric"
    }

    async fn handle(&self, _id: u64, ctx: &TaskContext) -> Result<()> {
        let key = format!("metrics:requests:{}", self.endpoint);
        ctx.cache.incr(&key, 1, Some(METRIC_TTL_SECS)).await?;
        Ok(())
    }
}

/// Persist one audit line for a mutation.
pub struct AuditLogTask {
    pub entity: &'static str,
    pub action: &'static str,
    pub entity_id: i64,
}

#[async_trait]
impl BackgroundTask for AuditLogTask {
    fn name(&self) -> &'static str {
        "audit_log"
    }

    async fn handle(&self, _id: u64, ctx: &TaskContext) -> Result<()> {
        let entity = self.entity;
        let action = self.action;
        let entity_id = self.entity_id;
        let created_at = crate::cache::now_secs() as i64;
        ctx.sql
            .with_connection_retry(move |conn| async move {
                conn.execute(
                    "INSERT INTO audit_log (entity, action, entity_id, created_at) \
                     VALUES ($1, $2, $3, $4)",
                    &[&entity, &action, &entity_id, &created_at],
                )
                .await?;
                Ok(())
            })
            .await
    }
}

/// Re-assert a list invalidation whose synchronous bump failed.
pub struct InvalidateListsTask {
    pub entity: &'static str,
}

#[async_trait]
impl BackgroundTask for InvalidateListsTask {
    fn name(&self) -> &'static str {
        "invalidate_lists"
    }

    async fn handle(&self, _id: u64, ctx: &TaskContext) -> Result<()> {
        if ctx.cache.invalidate_lists(self.entity).await {
            Ok(())
        } else {
            Err(crate::error::ServiceError::Unavailable(format!(
                "remote list invalidation for {} still failing",
                self.entity
            )))
        }
    }
}
