// SQL connector
//
// Raw tokio-postgres clients owned by the generic pool. Each connection's
// I/O driver runs on its own spawned task and terminates when the client is
// dropped, so `close` is a drop.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};

use crate::config::SqlConfig;
use crate::error::{Result, ServiceError};
use crate::pool::manager::{ConnectionPool, Connector};

pub type SqlPool = ConnectionPool<SqlConnector>;

/// One pooled SQL session.
pub struct SqlConn {
    client: tokio_postgres::Client,
    id: u64,
    created_at: Instant,
    in_tx: AtomicBool,
    broken: AtomicBool,
}

impl SqlConn {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    pub fn in_transaction(&self) -> bool {
        self.in_tx.load(Ordering::SeqCst)
    }

    fn mark_broken(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    fn track(&self, err: tokio_postgres::Error) -> ServiceError {
        if err.is_closed() {
            self.mark_broken();
        }
        ServiceError::Sql(err)
    }

    pub async fn query(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>> {
        self.client.query(sql, params).await.map_err(|e| self.track(e))
    }

    pub async fn query_opt(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<Row>> {
        self.client
            .query_opt(sql, params)
            .await
            .map_err(|e| self.track(e))
    }

    pub async fn query_one(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Row> {
        self.client
            .query_one(sql, params)
            .await
            .map_err(|e| self.track(e))
    }

    pub async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        self.client
            .execute(sql, params)
            .await
            .map_err(|e| self.track(e))
    }

    /// Run statements with no parameters or results (BEGIN/COMMIT/DDL).
    pub async fn batch(&self, sql: &str) -> Result<()> {
        self.client
            .batch_execute(sql)
            .await
            .map_err(|e| self.track(e))
    }
}

pub struct SqlConnector {
    config: SqlConfig,
    next_id: AtomicU64,
}

impl SqlConnector {
    pub fn new(config: SqlConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl Connector for SqlConnector {
    type Conn = SqlConn;

    async fn connect(&self) -> Result<SqlConn> {
        let (client, connection) =
            tokio_postgres::connect(&self.config.connection_string(), NoTls)
                .await
                .map_err(|e| ServiceError::CreateFailed(e.to_string()))?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::debug!(conn_id = id, error = %err, "sql connection terminated");
            }
        });
        Ok(SqlConn {
            client,
            id,
            created_at: Instant::now(),
            in_tx: AtomicBool::new(false),
            broken: AtomicBool::new(false),
        })
    }

    async fn is_valid(&self, conn: &SqlConn) -> bool {
        if conn.client.is_closed() {
            return false;
        }
        conn.client.simple_query("SELECT 1").await.is_ok()
    }

    fn has_broken(&self, conn: &SqlConn) -> bool {
        conn.broken.load(Ordering::SeqCst) || conn.client.is_closed()
    }
}

impl ConnectionPool<SqlConnector> {
    /// Run `f` inside a transaction on this task's connection. Only the
    /// outermost scope issues BEGIN/COMMIT/ROLLBACK; nested calls join the
    /// open transaction through the reentrant lease.
    pub async fn with_transaction<F, Fut, R>(self: &Arc<Self>, f: F) -> Result<R>
    where
        F: FnOnce(Arc<SqlConn>) -> Fut,
        Fut: std::future::Future<Output = Result<R>>,
    {
        self.with_connection(|conn| async move {
            let outermost = !conn.in_tx.swap(true, Ordering::SeqCst);
            if outermost {
                if let Err(err) = conn.batch("BEGIN").await {
                    conn.in_tx.store(false, Ordering::SeqCst);
                    return Err(err);
                }
            }

            let result = f(Arc::clone(&conn)).await;

            if outermost {
                let finish = match &result {
                    Ok(_) => conn.batch("COMMIT").await,
                    Err(_) => conn.batch("ROLLBACK").await,
                };
                conn.in_tx.store(false, Ordering::SeqCst);
                if let Err(err) = finish {
                    // The session state is unknown now; make sure the pool
                    // discards it instead of requeueing.
                    conn.mark_broken();
                    if result.is_ok() {
                        return Err(err);
                    }
                }
            }
            result
        })
        .await
    }
}
