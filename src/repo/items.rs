// Item repository
//
// Same shape as the user repository; the unique key here is the SKU.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_postgres::Row;

use crate::cache::{now_secs, CacheTier, TwoTierCache};
use crate::error::{Result, ServiceError};
use crate::pool::{retry, SqlPool};
use crate::repo::{ListParams, Page};
use crate::tasks::{AuditLogTask, InvalidateListsTask, InvalidateRecordTask, TaskQueue};

const ENTITY: &str = "items";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: i64,
    pub sku: String,
    pub name: String,
    pub price_cents: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewItem {
    pub sku: String,
    pub name: String,
    pub price_cents: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemPatch {
    pub name: Option<String>,
    pub price_cents: Option<i64>,
}

fn map_row(row: &Row) -> Result<Item> {
    Ok(Item {
        id: row.try_get("id")?,
        sku: row.try_get("sku")?,
        name: row.try_get("name")?,
        price_cents: row.try_get("price_cents")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn validate(sku: &str, name: &str, price_cents: i64) -> Result<()> {
    if sku.trim().is_empty() || sku.len() > 64 {
        return Err(ServiceError::Validation("sku must be 1..=64 chars".into()));
    }
    if name.trim().is_empty() || name.len() > 200 {
        return Err(ServiceError::Validation("name must be 1..=200 chars".into()));
    }
    if price_cents < 0 {
        return Err(ServiceError::Validation("price_cents must be >= 0".into()));
    }
    Ok(())
}

#[derive(Clone)]
pub struct ItemRepository {
    sql: Arc<SqlPool>,
    cache: Arc<TwoTierCache>,
    tasks: TaskQueue,
}

impl ItemRepository {
    pub fn new(sql: Arc<SqlPool>, cache: Arc<TwoTierCache>, tasks: TaskQueue) -> Self {
        Self { sql, cache, tasks }
    }

    pub async fn create(&self, new: NewItem) -> Result<Item> {
        validate(&new.sku, &new.name, new.price_cents)?;
        let now = now_secs() as i64;
        let price = new.price_cents;

        let sku = new.sku.clone();
        let name = new.name.clone();
        let resolver_sql = Arc::clone(&self.sql);
        let resolver_sku = new.sku.clone();

        let id = self
            .sql
            .with_connection_retry_for_create(
                move |conn| {
                    let sku = sku.clone();
                    let name = name.clone();
                    async move {
                        let row = conn
                            .query_one(
                                "INSERT INTO items (sku, name, price_cents, created_at, updated_at) \
                                 VALUES ($1, $2, $3, $4, $5) RETURNING id",
                                &[&sku, &name, &price, &now, &now],
                            )
                            .await?;
                        let id: i64 = row.try_get(0)?;
                        Ok(id)
                    }
                },
                move |dup| {
                    let sql = Arc::clone(&resolver_sql);
                    let sku = if dup.value.is_empty() {
                        resolver_sku.clone()
                    } else {
                        dup.value
                    };
                    async move {
                        sql.with_connection(|conn| async move {
                            let row = conn
                                .query_opt("SELECT id FROM items WHERE sku = $1", &[&sku])
                                .await?;
                            match row {
                                Some(row) => {
                                    let id: i64 = row.try_get(0)?;
                                    Ok(Some(id))
                                }
                                None => Ok(None),
                            }
                        })
                        .await
                    }
                },
            )
            .await?;

        // Read-after-write against a lagging replica: NOT_FOUND is transient.
        let pool_settings = self.sql.settings();
        let item = retry::retry_with_backoff(
            pool_settings.max_retries,
            pool_settings.retry_base_delay(),
            retry::should_force_retry,
            |_attempt| self.fetch(id),
        )
        .await?;
        self.write_through(&item).await;
        if !self.cache.invalidate_lists(ENTITY).await {
            self.tasks.dispatch(InvalidateListsTask { entity: ENTITY });
        }
        self.tasks.dispatch(AuditLogTask {
            entity: ENTITY,
            action: "create",
            entity_id: id,
        });
        Ok(item)
    }

    pub async fn find(&self, id: i64) -> Result<(CacheTier, Item)> {
        let (tier, cached) = self.cache.get_record(ENTITY, "id", &id.to_string()).await;
        if let Some(json) = cached {
            match serde_json::from_str(&json) {
                Ok(item) => return Ok((tier, item)),
                Err(err) => {
                    tracing::warn!(id, error = %err, "corrupt cached item, refetching");
                }
            }
        }

        let item = self.fetch(id).await?;
        self.write_through(&item).await;
        Ok((CacheTier::None, item))
    }

    pub async fn list(&self, params: ListParams) -> Result<(CacheTier, Page<Item>)> {
        let query = params.to_query();
        let (tier, cached) = self.cache.get_list(ENTITY, &query).await;
        if let Some(json) = cached {
            match serde_json::from_str(&json) {
                Ok(page) => return Ok((tier, page)),
                Err(err) => {
                    tracing::warn!(error = %err, "corrupt cached item list, refetching");
                }
            }
        }

        let limit = params.limit();
        let offset = params.offset();
        let (rows, total) = self
            .sql
            .with_connection_retry(move |conn| async move {
                let rows = conn
                    .query(
                        "SELECT id, sku, name, price_cents, created_at, updated_at \
                         FROM items ORDER BY id LIMIT $1 OFFSET $2",
                        &[&limit, &offset],
                    )
                    .await?;
                let total = conn.query_one("SELECT COUNT(*) FROM items", &[]).await?;
                let total: i64 = total.try_get(0)?;
                Ok((rows, total))
            })
            .await?;

        let data = rows.iter().map(map_row).collect::<Result<Vec<_>>>()?;
        let page = Page {
            data,
            total: total.max(0) as u64,
            page: params.page(),
            per_page: params.per_page(),
        };

        let json = serde_json::to_string(&page)?;
        if let Err(err) = self.cache.set_list(ENTITY, &query, &json, None).await {
            tracing::warn!(error = %err, "item list write-through failed");
        }
        Ok((CacheTier::None, page))
    }

    pub async fn update(&self, id: i64, patch: ItemPatch) -> Result<Item> {
        if patch.name.is_none() && patch.price_cents.is_none() {
            return Err(ServiceError::Validation("empty patch".into()));
        }
        if let Some(name) = &patch.name {
            if name.trim().is_empty() || name.len() > 200 {
                return Err(ServiceError::Validation("name must be 1..=200 chars".into()));
            }
        }
        if let Some(price) = patch.price_cents {
            if price < 0 {
                return Err(ServiceError::Validation("price_cents must be >= 0".into()));
            }
        }
        let now = now_secs() as i64;

        let patch_name = patch.name.clone();
        let patch_price = patch.price_cents;
        let item = self
            .sql
            .with_transaction(move |conn| async move {
                let exists = conn
                    .query_opt("SELECT id FROM items WHERE id = $1 FOR UPDATE", &[&id])
                    .await?;
                if exists.is_none() {
                    return Err(ServiceError::NotFound(format!("item {}", id)));
                }
                let row = conn
                    .query_one(
                        "UPDATE items SET name = COALESCE($2, name), \
                         price_cents = COALESCE($3, price_cents), updated_at = $4 \
                         WHERE id = $1 \
                         RETURNING id, sku, name, price_cents, created_at, updated_at",
                        &[&id, &patch_name, &patch_price, &now],
                    )
                    .await?;
                map_row(&row)
            })
            .await?;

        if let Err(err) = self
            .cache
            .invalidate_record(ENTITY, "id", &id.to_string())
            .await
        {
            tracing::error!(id, error = %err, "item record invalidation failed; staleness observable");
        }
        self.write_through(&item).await;
        if !self.cache.invalidate_lists(ENTITY).await {
            self.tasks.dispatch(InvalidateListsTask { entity: ENTITY });
        }
        self.tasks.dispatch(AuditLogTask {
            entity: ENTITY,
            action: "update",
            entity_id: id,
        });
        Ok(item)
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        let row = self
            .sql
            .with_connection_retry(move |conn| async move {
                conn.query_opt("DELETE FROM items WHERE id = $1 RETURNING sku", &[&id])
                    .await
            })
            .await?;
        let row = row.ok_or_else(|| ServiceError::NotFound(format!("item {}", id)))?;
        let sku: String = row.try_get(0)?;

        if let Err(err) = self
            .cache
            .invalidate_record(ENTITY, "id", &id.to_string())
            .await
        {
            tracing::error!(id, error = %err, "item record invalidation failed; staleness observable");
        }
        self.tasks.dispatch(InvalidateRecordTask {
            entity: ENTITY,
            column: "sku",
            value: sku,
        });
        if !self.cache.invalidate_lists(ENTITY).await {
            self.tasks.dispatch(InvalidateListsTask { entity: ENTITY });
        }
        self.tasks.dispatch(AuditLogTask {
            entity: ENTITY,
            action: "delete",
            entity_id: id,
        });
        Ok(())
    }

    async fn fetch(&self, id: i64) -> Result<Item> {
        let row = self
            .sql
            .with_connection_retry(move |conn| async move {
                conn.query_opt(
                    "SELECT id, sku, name, price_cents, created_at, updated_at \
                     FROM items WHERE id = $1",
                    &[&id],
                )
                .await
            })
            .await?;
        let row = row.ok_or_else(|| ServiceError::NotFound(format!("item {}", id)))?;
        map_row(&row)
    }

    async fn write_through(&self, item: &Item) {
        let json = match serde_json::to_string(item) {
            Ok(json) => json,
            Err(err) => {
                tracing::warn!(id = item.id, error = %err, "item serialization failed");
                return;
            }
        };
        if let Err(err) = self
            .cache
            .set_record(ENTITY, "id", &item.id.to_string(), &json, None)
            .await
        {
            tracing::warn!(id = item.id, error = %err, "item record write-through failed");
        }
        if let Err(err) = self
            .cache
            .set_record(ENTITY, "sku", &item.sku, &json, None)
            .await
        {
            tracing::warn!(id = item.id, error = %err, "item sku record write-through failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_validation() {
        assert!(validate("SKU-1", "Widget", 100).is_ok());
        assert!(validate("", "Widget", 100).is_err());
        assert!(validate("SKU-1", "", 100).is_err());
        assert!(validate("SKU-1", "Widget", -5).is_err());
    }
}
