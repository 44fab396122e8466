// Two-tier cache
//
// Local tier first, shared remote tier second. Reads warm the local tier
// with a short TTL on a remote hit; writes go through to both tiers. The
// remote tier is authoritative: local failures are logged and skipped,
// remote write failures surface to the caller. Version tokens are refreshed
// from the remote on every list path so a stale local token heals within
// one round trip.

use std::collections::BTreeMap;

use crate::cache::local::LocalCache;
use crate::cache::remote::RemoteCache;
use crate::config::CacheSettings;
use crate::error::Result;

/// Which tier answered a read; surfaced as `X-Cache-Type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Local,
    Remote,
    None,
}

impl CacheTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::Local => "LOCAL",
            CacheTier::Remote => "REMOTE",
            CacheTier::None => "NONE",
        }
    }
}

pub struct TwoTierCache {
    local: LocalCache,
    remote: RemoteCache,
    settings: CacheSettings,
    entities: Vec<&'static str>,
}

impl TwoTierCache {
    pub fn new(
        local: LocalCache,
        remote: RemoteCache,
        settings: CacheSettings,
        entities: Vec<&'static str>,
    ) -> Self {
        Self {
            local,
            remote,
            settings,
            entities,
        }
    }

    pub fn local(&self) -> &LocalCache {
        &self.local
    }

    pub fn remote(&self) -> &RemoteCache {
        &self.remote
    }

    // Raw keyspace

    /// Read through both tiers. Remote failures degrade to a miss so the
    /// caller falls back to the origin.
    pub async fn get(&self, key: &str) -> (CacheTier, Option<String>) {
        if let Some(value) = self.local.get(key) {
            return (CacheTier::Local, Some(value));
        }
        match self.remote.get(key).await {
            Ok(Some(value)) => {
                self.warm_local(key, &value);
                (CacheTier::Remote, Some(value))
            }
            Ok(None) => (CacheTier::None, None),
            Err(err) => {
                tracing::warn!(key, error = %err, "remote cache read failed, degrading to origin");
                (CacheTier::None, None)
            }
        }
    }

    /// Write through both tiers. The local write is best-effort.
    pub async fn set(&self, key: &str, value: &str, ttl: Option<u64>) -> Result<()> {
        if let Err(err) = self
            .local
            .set(key, value, ttl.or(Some(self.settings.record_ttl_secs)))
        {
            tracing::warn!(key, error = %err, "local cache write skipped");
        }
        self.remote
            .set(key, value, ttl.unwrap_or(self.settings.record_ttl_secs))
            .await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.local.delete(key);
        self.remote.delete(key).await?;
        Ok(())
    }

    // Remote hits warm the local tier under a short TTL so the next read is
    // local while staleness stays bounded.
    fn warm_local(&self, key: &str, value: &str) {
        if let Err(err) = self
            .local
            .set(key, value, Some(self.settings.local_warm_ttl_secs))
        {
            tracing::debug!(key, error = %err, "local warm-up skipped");
        }
    }

    /// Gauge-style counter: best-effort local increment, authoritative remote
    /// increment (TTL applied on creation), max of the two observed values.
    pub async fn incr(&self, key: &str, delta: i64, ttl: Option<u64>) -> Result<i64> {
        let local_value = match self.local.incr(key, delta, ttl) {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!(key, error = %err, "local counter increment skipped");
                0
            }
        };
        let remote_value = self.remote.incr(key, delta, ttl).await?;
        Ok(local_value.max(remote_value))
    }

    // Record keyspace

    pub async fn get_record(
        &self,
        entity: &str,
        column: &str,
        value: &str,
    ) -> (CacheTier, Option<String>) {
        if let Some(data) = self.local.get_record(entity, column, value) {
            return (CacheTier::Local, Some(data));
        }
        match self.remote.get_record(entity, column, value).await {
            Ok(Some(data)) => {
                if let Err(err) = self.local.set_record(
                    entity,
                    column,
                    value,
                    &data,
                    Some(self.settings.local_warm_ttl_secs),
                ) {
                    tracing::debug!(entity, column, error = %err, "local warm-up skipped");
                }
                (CacheTier::Remote, Some(data))
            }
            Ok(None) => (CacheTier::None, None),
            Err(err) => {
                tracing::warn!(entity, column, error = %err, "remote record read failed, degrading to origin");
                (CacheTier::None, None)
            }
        }
    }

    pub async fn set_record(
        &self,
        entity: &str,
        column: &str,
        value: &str,
        data: &str,
        ttl: Option<u64>,
    ) -> Result<()> {
        if let Err(err) = self.local.set_record(entity, column, value, data, ttl) {
            tracing::warn!(entity, column, error = %err, "local record write skipped");
        }
        self.remote
            .set_record(entity, column, value, data, ttl)
            .await
    }

    /// Drop a record from both tiers; the remote delete is authoritative.
    pub async fn invalidate_record(&self, entity: &str, column: &str, value: &str) -> Result<()> {
        self.local.delete_record(entity, column, value);
        self.remote.delete_record(entity, column, value).await?;
        Ok(())
    }

    // Versioned list keyspace

    pub async fn get_list(
        &self,
        entity: &str,
        query: &BTreeMap<String, String>,
    ) -> (CacheTier, Option<String>) {
        if let Some(data) = self.local.get_list(entity, query) {
            return (CacheTier::Local, Some(data));
        }
        // Local miss: refresh the local token from the authoritative remote
        // before consulting it, so the warm-up lands under the right version.
        match self.remote.version(entity).await {
            Ok(version) => {
                if version != self.local.version(entity) {
                    if let Err(err) = self.local.set_version(entity, version) {
                        tracing::debug!(entity, error = %err, "local version refresh skipped");
                    }
                }
            }
            Err(err) => {
                tracing::warn!(entity, error = %err, "remote version read failed, degrading to origin");
                return (CacheTier::None, None);
            }
        }
        match self.remote.get_list(entity, query).await {
            Ok(Some(data)) => {
                if let Err(err) = self.local.set_list(
                    entity,
                    query,
                    &data,
                    Some(self.settings.local_warm_ttl_secs),
                ) {
                    tracing::debug!(entity, error = %err, "local list warm-up skipped");
                }
                (CacheTier::Remote, Some(data))
            }
            Ok(None) => (CacheTier::None, None),
            Err(err) => {
                tracing::warn!(entity, error = %err, "remote list read failed, degrading to origin");
                (CacheTier::None, None)
            }
        }
    }

    pub async fn set_list(
        &self,
        entity: &str,
        query: &BTreeMap<String, String>,
        data: &str,
        ttl: Option<u64>,
    ) -> Result<()> {
        match self.remote.version(entity).await {
            Ok(version) => {
                if let Err(err) = self.local.set_version(entity, version) {
                    tracing::debug!(entity, error = %err, "local version refresh skipped");
                }
            }
            Err(err) => {
                tracing::warn!(entity, error = %err, "remote version read failed before list write");
            }
        }
        if let Err(err) = self.local.set_list(entity, query, data, ttl) {
            tracing::warn!(entity, error = %err, "local list write skipped");
        }
        self.remote.set_list(entity, query, data, ttl).await
    }

    /// Bump the version token in both tiers. A remote failure here is
    /// observable staleness: it is flagged loudly but does not fail the
    /// mutation that triggered the invalidation. Returns whether the
    /// authoritative remote bump landed, so callers can re-assert it.
    pub async fn invalidate_lists(&self, entity: &str) -> bool {
        if let Err(err) = self.local.invalidate_lists(entity) {
            tracing::warn!(entity, error = %err, "local list invalidation skipped");
        }
        match self.remote.invalidate_lists(entity).await {
            Ok(version) => {
                if let Err(err) = self.local.set_version(entity, version) {
                    tracing::debug!(entity, error = %err, "local version refresh skipped");
                }
                true
            }
            Err(err) => {
                tracing::error!(
                    entity,
                    error = %err,
                    "remote list invalidation failed; stale lists remain observable until TTL"
                );
                false
            }
        }
    }

    /// Periodic sweep: expired local rows plus stale list generations in
    /// both tiers.
    pub async fn gc(&self) -> Result<usize> {
        let keep = self.settings.gc_keep_versions;
        let mut removed = self.local.gc();
        removed += self.local.gc_old_list_versions(&self.entities, keep);
        removed += self.remote.gc_old_list_versions(&self.entities, keep).await?;
        Ok(removed)
    }
}
