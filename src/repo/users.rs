// User repository
//
// The create path runs under the duplicate-key recovery wrapper: when our
// own retried INSERT trips the unique email index, the resolver looks the
// row up and both callers converge on one id without surfacing an error.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_postgres::Row;

use crate::cache::{now_secs, CacheTier, TwoTierCache};
use crate::error::{Result, ServiceError};
use crate::pool::{retry, SqlPool};
use crate::repo::{ListParams, Page};
use crate::tasks::{AuditLogTask, InvalidateListsTask, InvalidateRecordTask, TaskQueue};

const ENTITY: &str = "users";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserPatch {
    pub name: Option<String>,
    pub email: Option<String>,
}

fn map_row(row: &Row) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn validate_email(email: &str) -> Result<()> {
    if email.is_empty() || !email.contains('@') || email.len() > 254 {
        return Err(ServiceError::Validation(format!("invalid email: {:?}", email)));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() || name.len() > 120 {
        return Err(ServiceError::Validation("name must be 1..=120 chars".into()));
    }
    Ok(())
}

#[derive(Clone)]
pub struct UserRepository {
    sql: Arc<SqlPool>,
    cache: Arc<TwoTierCache>,
    tasks: TaskQueue,
}

impl UserRepository {
    pub fn new(sql: Arc<SqlPool>, cache: Arc<TwoTierCache>, tasks: TaskQueue) -> Self {
        Self { sql, cache, tasks }
    }

    pub async fn create(&self, new: NewUser) -> Result<User> {
        validate_name(&new.name)?;
        validate_email(&new.email)?;
        let now = now_secs() as i64;

        let name = new.name.clone();
        let email = new.email.clone();
        let resolver_sql = Arc::clone(&self.sql);
        let resolver_email = new.email.clone();

        let id = self
            .sql
            .with_connection_retry_for_create(
                move |conn| {
                    let name = name.clone();
                    let email = email.clone();
                    async move {
                        let row = conn
                            .query_one(
                                "INSERT INTO users (name, email, created_at, updated_at) \
                                 VALUES ($1, $2, $3, $4) RETURNING id",
                                &[&name, &email, &now, &now],
                            )
                            .await?;
                        let id: i64 = row.try_get(0)?;
                        Ok(id)
                    }
                },
                move |dup| {
                    let sql = Arc::clone(&resolver_sql);
                    let email = if dup.value.is_empty() {
                        resolver_email.clone()
                    } else {
                        dup.value
                    };
                    async move {
                        sql.with_connection(|conn| async move {
                            let row = conn
                                .query_opt("SELECT id FROM users WHERE email = $1", &[&email])
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

        // Read-after-write: a lagging replica may not see the row yet, so
        // NOT_FOUND counts as transient here.
        let pool_settings = self.sql.settings();
        let user = retry::retry_with_backoff(
            pool_settings.max_retries,
            pool_settings.retry_base_delay(),
            retry::should_force_retry,
            |_attempt| self.fetch(id),
        )
        .await?;
        self.write_through(&user).await;
        if !self.cache.invalidate_lists(ENTITY).await {
            self.tasks.dispatch(InvalidateListsTask { entity: ENTITY });
        }
        self.tasks.dispatch(AuditLogTask {
            entity: ENTITY,
            action: "create",
            entity_id: id,
        });
        Ok(user)
    }

    /// Read-through by id. The tier tells the handler what `X-Cache-Type`
    /// to emit.
    pub async fn find(&self, id: i64) -> Result<(CacheTier, User)> {
        let (tier, cached) = self
            .cache
            .get_record(ENTITY, "id", &id.to_string())
            .await;
        if let Some(json) = cached {
            match serde_json::from_str(&json) {
                Ok(user) => return Ok((tier, user)),
                Err(err) => {
                    tracing::warn!(id, error = %err, "corrupt cached user, refetching");
                }
            }
        }

        let user = self.fetch(id).await?;
        self.write_through(&user).await;
        Ok((CacheTier::None, user))
    }

    pub async fn list(&self, params: ListParams) -> Result<(CacheTier, Page<User>)> {
        let query = params.to_query();
        let (tier, cached) = self.cache.get_list(ENTITY, &query).await;
        if let Some(json) = cached {
            match serde_json::from_str(&json) {
                Ok(page) => return Ok((tier, page)),
                Err(err) => {
                    tracing::warn!(error = %err, "corrupt cached user list, refetching");
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
                        "SELECT id, name, email, created_at, updated_at FROM users \
                         ORDER BY id LIMIT $1 OFFSET $2",
                        &[&limit, &offset],
                    )
                    .await?;
                let total = conn
                    .query_one("SELECT COUNT(*) FROM users", &[])
                    .await?;
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
            tracing::warn!(error = %err, "user list write-through failed");
        }
        Ok((CacheTier::None, page))
    }

    pub async fn update(&self, id: i64, patch: UserPatch) -> Result<User> {
        if patch.name.is_none() && patch.email.is_none() {
            return Err(ServiceError::Validation("empty patch".into()));
        }
        if let Some(name) = &patch.name {
            validate_name(name)?;
        }
        if let Some(email) = &patch.email {
            validate_email(email)?;
        }
        let now = now_secs() as i64;

        let patch_name = patch.name.clone();
        let patch_email = patch.email.clone();
        let (old_email, user) = self
            .sql
            .with_transaction(move |conn| async move {
                let old = conn
                    .query_opt("SELECT email FROM users WHERE id = $1 FOR UPDATE", &[&id])
                    .await?;
                let old = old.ok_or_else(|| ServiceError::NotFound(format!("user {}", id)))?;
                let old_email: String = old.try_get(0)?;

                let row = conn
                    .query_one(
                        "UPDATE users SET name = COALESCE($2, name), \
                         email = COALESCE($3, email), updated_at = $4 \
                         WHERE id = $1 \
                         RETURNING id, name, email, created_at, updated_at",
                        &[&id, &patch_name, &patch_email, &now],
                    )
                    .await?;
                Ok((old_email, map_row(&row)?))
            })
            .await?;

        self.invalidate(&user, Some(old_email)).await;
        self.write_through(&user).await;
        if !self.cache.invalidate_lists(ENTITY).await {
            self.tasks.dispatch(InvalidateListsTask { entity: ENTITY });
        }
        self.tasks.dispatch(AuditLogTask {
            entity: ENTITY,
            action: "update",
            entity_id: id,
        });
        Ok(user)
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        let row = self
            .sql
            .with_connection_retry(move |conn| async move {
                conn.query_opt("DELETE FROM users WHERE id = $1 RETURNING email", &[&id])
                    .await
            })
            .await?;
        let row = row.ok_or_else(|| ServiceError::NotFound(format!("user {}", id)))?;
        let email: String = row.try_get(0)?;

        if let Err(err) = self.cache.invalidate_record(ENTITY, "id", &id.to_string()).await {
            tracing::error!(id, error = %err, "user record invalidation failed; staleness observable");
        }
        self.tasks.dispatch(InvalidateRecordTask {
            entity: ENTITY,
            column: "email",
            value: email,
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

    async fn fetch(&self, id: i64) -> Result<User> {
        let row = self
            .sql
            .with_connection_retry(move |conn| async move {
                conn.query_opt(
                    "SELECT id, name, email, created_at, updated_at FROM users WHERE id = $1",
                    &[&id],
                )
                .await
            })
            .await?;
        let row = row.ok_or_else(|| ServiceError::NotFound(format!("user {}", id)))?;
        map_row(&row)
    }

    // Records are cached under both lookup columns. A cache write failure
    // after a successful origin read/write is a skip, not an error.
    async fn write_through(&self, user: &User) {
        let json = match serde_json::to_string(user) {
            Ok(json) => json,
            Err(err) => {
                tracing::warn!(id = user.id, error = %err, "user serialization failed");
                return;
            }
        };
        if let Err(err) = self
            .cache
            .set_record(ENTITY, "id", &user.id.to_string(), &json, None)
            .await
        {
            tracing::warn!(id = user.id, error = %err, "user record write-through failed");
        }
        if let Err(err) = self
            .cache
            .set_record(ENTITY, "email", &user.email, &json, None)
            .await
        {
            tracing::warn!(id = user.id, error = %err, "user email record write-through failed");
        }
    }

    async fn invalidate(&self, user: &User, old_email: Option<String>) {
        if let Err(err) = self
            .cache
            .invalidate_record(ENTITY, "id", &user.id.to_string())
            .await
        {
            tracing::error!(id = user.id, error = %err, "user record invalidation failed; staleness observable");
        }
        if let Some(old_email) = old_email {
            if old_email != user.email {
                self.tasks.dispatch(InvalidateRecordTask {
                    entity: ENTITY,
                    column: "email",
                    value: old_email,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_validation() {
        assert!(validate_email("a@b").is_ok());
        assert!(validate_email("").is_err());
        assert!(validate_email("not-an-email").is_err());
        assert!(validate_email(&format!("{}@b", "x".repeat(300))).is_err());
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("Ada").is_ok());
        assert!(validate_name("  ").is_err());
        assert!(validate_name(&"x".repeat(200)).is_err());
    }
}
