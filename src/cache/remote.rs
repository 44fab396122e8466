// Remote cache tier
//
// The same keyspace as the local tier, bound to the shared KV store through
// the KV pool. Every operation checks a connection out with the generic
// retry wrapper, so transient socket failures heal transparently. Values are
// UTF-8 JSON; other services read this keyspace, so formats here are frozen.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cache::keys::{self, parse_list_version};
use crate::config::CacheSettings;
use crate::error::Result;
use crate::pool::KvPool;

/// SCAN page size for the version GC sweep.
const SCAN_PAGE: usize = 200;

#[derive(Clone)]
pub struct RemoteCache {
    pool: Arc<KvPool>,
    settings: CacheSettings,
}

impl RemoteCache {
    pub fn new(pool: Arc<KvPool>, settings: CacheSettings) -> Self {
        Self { pool, settings }
    }

    pub fn pool(&self) -> &Arc<KvPool> {
        &self.pool
    }

    // Raw keyspace operations

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.pool
            .with_connection_retry(move |conn| {
                let key = key.clone();
                async move { conn.get(&key).await }
            })
            .await
    }

    pub async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.pool
            .with_connection_retry(move |conn| {
                let key = key.clone();
                let value = value.clone();
                async move { conn.set_ex(&key, &value, ttl_secs).await }
            })
            .await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.pool
            .with_connection_retry(move |conn| {
                let key = key.clone();
                async move { conn.del(&key).await }
            })
            .await
    }

    /// Atomic increment; the key gets its TTL on first creation only.
    pub async fn incr(&self, key: &str, delta: i64, ttl_secs: Option<u64>) -> Result<i64> {
        let key = key.to_string();
        self.pool
            .with_connection_retry(move |conn| {
                let key = key.clone();
                async move {
                    let value = conn.incr_by(&key, delta).await?;
                    if value == delta {
                        if let Some(ttl) = ttl_secs {
                            conn.expire(&key, ttl as i64).await?;
                        }
                    }
                    Ok(value)
                }
            })
            .await
    }

    // Record keyspace

    pub async fn get_record(
        &self,
        entity: &str,
        column: &str,
        value: &str,
    ) -> Result<Option<String>> {
        self.get(&keys::record_key(entity, column, value)).await
    }

    pub async fn set_record(
        &self,
        entity: &str,
        column: &str,
        value: &str,
        data: &str,
        ttl: Option<u64>,
    ) -> Result<()> {
        let ttl = ttl.unwrap_or(self.settings.record_ttl_secs);
        self.set(&keys::record_key(entity, column, value), data, ttl)
            .await
    }

    pub async fn delete_record(&self, entity: &str, column: &str, value: &str) -> Result<bool> {
        self.delete(&keys::record_key(entity, column, value)).await
    }

    // Versioned list keyspace

    /// Authoritative version token; 1 when the key is absent.
    pub async fn version(&self, entity: &str) -> Result<u64> {
        let value = self.get(&keys::version_key(entity)).await?;
        Ok(value
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(1))
    }

    /// Single atomic increment. A bump that lands on 1 means the key did not
    /// exist, and 1 is indistinguishable from the default read value, so it
    /// is pushed once more to make the invalidation observable.
    pub async fn invalidate_lists(&self, entity: &str) -> Result<u64> {
        let key = keys::version_key(entity);
        let mut version = self.incr(&key, 1, None).await?;
        if version == 1 {
            version = self.incr(&key, 1, None).await?;
        }
        Ok(version.max(0) as u64)
    }

    pub async fn get_list(
        &self,
        entity: &str,
        query: &BTreeMap<String, String>,
    ) -> Result<Option<String>> {
        let version = self.version(entity).await?;
        self.get(&keys::list_key(entity, version, query)).await
    }

    pub async fn set_list(
        &self,
        entity: &str,
        query: &BTreeMap<String, String>,
        data: &str,
        ttl: Option<u64>,
    ) -> Result<()> {
        let version = self.version(entity).await?;
        let ttl = ttl.unwrap_or(self.settings.list_ttl_secs);
        self.set(&keys::list_key(entity, version, query), data, ttl)
            .await
    }

    /// Cursor-scan the entity's list keys and batch-delete generations that
    /// fell `keep` or more behind the current token. Never a blocking
    /// full-keyspace enumeration.
    pub async fn gc_old_list_versions(&self, entities: &[&str], keep: u64) -> Result<usize> {
        let mut removed = 0usize;
        for entity in entities {
            let current = self.version(entity).await?;
            let Some(cutoff) = current.checked_sub(keep) else {
                continue;
            };
            let pattern = format!("{}*", keys::list_key_prefix(entity));
            let mut cursor = 0u64;
            loop {
                let entity = entity.to_string();
                let page_pattern = pattern.clone();
                let (next, keys_page) = self
                    .pool
                    .with_connection_retry(move |conn| {
                        let pattern = page_pattern.clone();
                        async move { conn.scan(cursor, &pattern, SCAN_PAGE).await }
                    })
                    .await?;

                let doomed: Vec<String> = keys_page
                    .into_iter()
                    .filter(|key| {
                        parse_list_version(key, &entity)
                            .map(|version| version <= cutoff)
                            .unwrap_or(false)
                    })
                    .collect();
                if !doomed.is_empty() {
                    let batch = doomed.clone();
                    let count = self
                        .pool
                        .with_connection_retry(move |conn| {
                            let batch = batch.clone();
                            async move { conn.del_many(&batch).await }
                        })
                        .await?;
                    removed += count.max(0) as usize;
                }

                cursor = next;
                if cursor == 0 {
                    break;
                }
            }
        }
        Ok(removed)
    }
}
