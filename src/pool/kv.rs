// KV connector
//
// Multiplexed redis connections behind an explicit typed command surface:
// only the commands the service actually issues exist, so an unknown command
// is a compile error rather than a runtime proxy call.

use async_trait::async_trait;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use crate::config::KvConfig;
use crate::error::{Result, ServiceError};
use crate::pool::manager::{ConnectionPool, Connector};

pub type KvPool = ConnectionPool<KvConnector>;

/// One pooled KV session.
pub struct KvConn {
    conn: redis::aio::MultiplexedConnection,
    id: u64,
    created_at: Instant,
    broken: AtomicBool,
}

impl KvConn {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    // Multiplexed handles are cheap clones over one socket; commands take
    // &mut, so every call works on its own clone.
    fn handle(&self) -> redis::aio::MultiplexedConnection {
        self.conn.clone()
    }

    fn track(&self, err: redis::RedisError) -> ServiceError {
        if err.is_io_error() || err.is_connection_dropped() || err.is_unrecoverable_error() {
            self.broken.store(true, Ordering::SeqCst);
        }
        ServiceError::Kv(err)
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.handle();
        let value: Option<String> = conn.get(key).await.map_err(|e| self.track(e))?;
        Ok(value)
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.handle();
        let _: () = conn
            .set_ex(key, value, ttl_secs)
            .await
            .map_err(|e| self.track(e))?;
        Ok(())
    }

    pub async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.handle();
        let removed: i64 = conn.del(key).await.map_err(|e| self.track(e))?;
        Ok(removed > 0)
    }

    pub async fn del_many(&self, keys: &[String]) -> Result<i64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.handle();
        let removed: i64 = conn
            .del(keys.to_vec())
            .await
            .map_err(|e| self.track(e))?;
        Ok(removed)
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.handle();
        let found: bool = conn.exists(key).await.map_err(|e| self.track(e))?;
        Ok(found)
    }

    pub async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.handle();
        let value: i64 = conn.incr(key, delta).await.map_err(|e| self.track(e))?;
        Ok(value)
    }

    pub async fn expire(&self, key: &str, ttl_secs: i64) -> Result<bool> {
        let mut conn = self.handle();
        let applied: bool = conn.expire(key, ttl_secs).await.map_err(|e| self.track(e))?;
        Ok(applied)
    }

    /// One page of a cursor scan; never a blocking full-keyspace walk.
    pub async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>)> {
        let mut conn = self.handle();
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.track(e))?;
        Ok((next, keys))
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.handle();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| self.track(e))?;
        Ok(())
    }
}

pub struct KvConnector {
    client: redis::Client,
    next_id: AtomicU64,
}

impl KvConnector {
    pub fn new(config: &KvConfig) -> Result<Self> {
        let client = redis::Client::open(config.url())?;
        Ok(Self {
            client,
            next_id: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl Connector for KvConnector {
    type Conn = KvConn;

    async fn connect(&self) -> Result<KvConn> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ServiceError::CreateFailed(e.to_string()))?;
        Ok(KvConn {
            conn,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            created_at: Instant::now(),
            broken: AtomicBool::new(false),
        })
    }

    async fn is_valid(&self, conn: &KvConn) -> bool {
        conn.ping().await.is_ok()
    }

    fn has_broken(&self, conn: &KvConn) -> bool {
        conn.broken.load(Ordering::SeqCst)
    }
}
