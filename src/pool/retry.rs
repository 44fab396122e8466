// Retry engine and error classification
//
// Exponential backoff over a classified error predicate. Predicates are
// layered: dialect-aware duplicate-key detection, connection-level failures,
// and a transient-message fallback. The duplicate-key parser understands the
// message shapes of MySQL, Postgres, SQLite and SQL Server so classification
// works even when only a message is available.

use once_cell::sync::Lazy;
use regex::Regex;
use std::future::Future;
use std::time::Duration;
use tokio_postgres::error::SqlState;

use crate::error::{Result, ServiceError};

/// Backoff never sleeps longer than this per attempt.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Shift cap so `1 << attempt` cannot overflow.
const MAX_BACKOFF_SHIFT: u32 = 16;

/// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.min(MAX_BACKOFF_SHIFT);
    std::cmp::min(base.saturating_mul(factor), MAX_BACKOFF)
}

/// Re-invoke `op` with exponential backoff while `predicate` classifies the
/// error as retryable. `max_retry = -1` retries without bound (startup init
/// only); otherwise the operation runs at most `max_retry + 1` times.
pub async fn retry_with_backoff<Op, Fut, R, P>(
    max_retry: i32,
    base: Duration,
    predicate: P,
    op: Op,
) -> Result<R>
where
    Op: Fn(u32) -> Fut,
    Fut: Future<Output = Result<R>>,
    P: Fn(&ServiceError) -> bool,
{
    let mut attempt: u32 = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !predicate(&err) {
                    return Err(err);
                }
                if max_retry >= 0 && attempt as i32 >= max_retry {
                    return Err(err);
                }
                tokio::time::sleep(backoff_delay(base, attempt)).await;
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

/// Parsed unique-constraint violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateKeyInfo {
    pub table: String,
    pub column: String,
    pub value: String,
}

static TRANSIENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)deadlock|timed?[ _-]?out|connection refused|temporarily unavailable|lost connection|server has gone away|connection reset|broken pipe",
    )
    .expect("transient pattern")
});

static DUPLICATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)duplicate entry|duplicate key value violates unique constraint|unique constraint failed|violation of unique key constraint",
    )
    .expect("duplicate pattern")
});

// MySQL: Duplicate entry 'a@b' for key 'users.email'
static MYSQL_DUP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Duplicate entry '(?P<value>[^']*)' for key '(?P<key>[^']+)'")
        .expect("mysql duplicate pattern")
});

// SQLite: UNIQUE constraint failed: users.email
static SQLITE_DUP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"UNIQUE constraint failed: (?P<table>\w+)\.(?P<column>\w+)")
        .expect("sqlite duplicate pattern")
});

// Postgres: duplicate key value violates unique constraint "users_email_key"
// with detail: Key (email)=(a@b) already exists.
static PG_DETAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Key \((?P<column>[^)]+)\)=\((?P<value>[^)]*)\)").expect("pg detail pattern")
});

static PG_CONSTRAINT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"unique constraint "(?P<constraint>[^"]+)""#).expect("pg constraint pattern")
});

// SQL Server: Violation of UNIQUE KEY constraint 'UQ_users_email'. Cannot
// insert duplicate key in object 'dbo.users'. The duplicate key value is (a@b).
static MSSQL_DUP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"Violation of UNIQUE KEY constraint '(?P<constraint>[^']+)'.*object '(?:dbo\.)?(?P<table>\w+)'(?:.*duplicate key value is \((?P<value>[^)]*)\))?",
    )
    .expect("mssql duplicate pattern")
});

/// Unique-constraint violation, detected per dialect.
pub fn is_duplicate_key(err: &ServiceError) -> bool {
    match err {
        ServiceError::DuplicateKey { .. } => true,
        ServiceError::Sql(e) => match e.code() {
            Some(code) => {
                code == &SqlState::UNIQUE_VIOLATION || code.code() == "23000"
            }
            None => DUPLICATE_RE.is_match(&e.to_string()),
        },
        other => DUPLICATE_RE.is_match(&other.to_string()),
    }
}

/// Best-effort extraction of `{table, column, value}` from a duplicate-key
/// error message. Missing pieces come back as empty strings.
pub fn parse_duplicate_key(err: &ServiceError) -> Option<DuplicateKeyInfo> {
    if !is_duplicate_key(err) {
        return None;
    }
    if let ServiceError::DuplicateKey {
        table,
        column,
        value,
    } = err
    {
        return Some(DuplicateKeyInfo {
            table: table.clone(),
            column: column.clone(),
            value: value.clone(),
        });
    }

    // The Postgres driver carries structured fields; use them when present.
    if let ServiceError::Sql(e) = err {
        if let Some(db) = e.as_db_error() {
            let detail = db.detail().unwrap_or_default();
            let (column, value) = match PG_DETAIL_RE.captures(detail) {
                Some(caps) => (caps["column"].to_string(), caps["value"].to_string()),
                None => (db.column().unwrap_or_default().to_string(), String::new()),
            };
            return Some(DuplicateKeyInfo {
                table: db.table().unwrap_or_default().to_string(),
                column,
                value,
            });
        }
    }

    let message = err.to_string();

    if let Some(caps) = MYSQL_DUP_RE.captures(&message) {
        let (table, column) = match caps["key"].split_once('.') {
            Some((table, column)) => (table.to_string(), column.to_string()),
            None => (String::new(), caps["key"].to_string()),
        };
        return Some(DuplicateKeyInfo {
            table,
            column,
            value: caps["value"].to_string(),
        });
    }

    if let Some(caps) = SQLITE_DUP_RE.captures(&message) {
        return Some(DuplicateKeyInfo {
            table: caps["table"].to_string(),
            column: caps["column"].to_string(),
            value: String::new(),
        });
    }

    if let Some(caps) = MSSQL_DUP_RE.captures(&message) {
        return Some(DuplicateKeyInfo {
            table: caps["table"].to_string(),
            column: constraint_column(&caps["constraint"], &caps["table"]),
            value: caps
                .name("value")
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
        });
    }

    if let Some(caps) = PG_CONSTRAINT_RE.captures(&message) {
        let constraint = &caps["constraint"];
        let (column, value) = match PG_DETAIL_RE.captures(&message) {
            Some(detail) => (detail["column"].to_string(), detail["value"].to_string()),
            None => (String::new(), String::new()),
        };
        let table = constraint.split('_').next().unwrap_or_default().to_string();
        let column = if column.is_empty() {
            constraint_column(constraint, &table)
        } else {
            column
        };
        return Some(DuplicateKeyInfo {
            table,
            column,
            value,
        });
    }

    Some(DuplicateKeyInfo {
        table: String::new(),
        column: String::new(),
        value: String::new(),
    })
}

// Constraint names follow `<table>_<column>_key` / `UQ_<table>_<column>`
// conventions; strip the table and decoration to recover the column.
fn constraint_column(constraint: &str, table: &str) -> String {
    let trimmed = constraint
        .trim_start_matches("UQ_")
        .trim_start_matches("uq_")
        .trim_end_matches("_key")
        .trim_end_matches("_idx");
    let trimmed = trimmed
        .strip_prefix(table)
        .map(|rest| rest.trim_start_matches('_'))
        .unwrap_or(trimmed);
    trimmed.to_string()
}

/// Network-level refusal while establishing a connection.
pub fn is_connection_refused(err: &ServiceError) -> bool {
    match err {
        ServiceError::Kv(e) => e.is_connection_refusal(),
        other => {
            let message = other.to_string();
            message.contains("connection refused")
                || message.contains("Connection refused")
                || message.contains("os error 111")
        }
    }
}

/// The server closed an established connection under us.
pub fn is_server_gone_away(err: &ServiceError) -> bool {
    match err {
        ServiceError::Sql(e) => {
            e.is_closed() || e.to_string().contains("server has gone away")
        }
        ServiceError::Kv(e) => e.is_connection_dropped(),
        other => {
            let message = other.to_string();
            message.contains("server has gone away") || message.contains("connection closed")
        }
    }
}

/// Message-level transient classification: deadlocks, timeouts, refused or
/// dropped connections, resource pressure.
pub fn is_retryable_transient(err: &ServiceError) -> bool {
    match err {
        ServiceError::Kv(e) if e.is_timeout() || e.is_io_error() => true,
        ServiceError::Timeout(_) => true,
        other => TRANSIENT_RE.is_match(&other.to_string()),
    }
}

/// The generic retry predicate used by `with_connection_retry`.
pub fn should_retry(err: &ServiceError) -> bool {
    matches!(
        err,
        ServiceError::CreateFailed(_) | ServiceError::QueryFailed(_)
    ) || is_retryable_transient(err)
        || is_connection_refused(err)
        || is_server_gone_away(err)
}

/// `should_retry` widened to treat NOT_FOUND as transient; used when polling
/// an eventually-consistent downstream for read-after-write visibility.
pub fn should_force_retry(err: &ServiceError) -> bool {
    should_retry(err) || matches!(err, ServiceError::NotFound(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(800));
        assert_eq!(backoff_delay(base, 31), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_retry_stops_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(
            2,
            Duration::from_millis(1),
            should_retry,
            |_attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ServiceError::CreateFailed("connection refused".into())) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_on_non_retryable() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(
            5,
            Duration::from_millis(1),
            should_retry,
            |_attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ServiceError::Validation("bad email".into())) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_succeeds_mid_flight() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(
            5,
            Duration::from_millis(1),
            should_retry,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(ServiceError::QueryFailed("deadlock detected".into()))
                    } else {
                        Ok(attempt)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.ok(), Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_retryable_transient(&ServiceError::Internal(
            "Deadlock found when trying to get lock".into()
        )));
        assert!(is_retryable_transient(&ServiceError::Internal(
            "Lock wait timeout exceeded".into()
        )));
        assert!(is_retryable_transient(&ServiceError::Internal(
            "connection refused".into()
        )));
        assert!(!is_retryable_transient(&ServiceError::Internal(
            "syntax error near SELECT".into()
        )));
    }

    #[test]
    fn test_duplicate_detection_by_message() {
        let mysql = ServiceError::QueryFailed(
            "Duplicate entry 'a@b' for key 'users.email'".into(),
        );
        assert!(is_duplicate_key(&mysql));
        let info = parse_duplicate_key(&mysql).unwrap();
        assert_eq!(info.table, "users");
        assert_eq!(info.column, "email");
        assert_eq!(info.value, "a@b");

        let sqlite =
            ServiceError::QueryFailed("UNIQUE constraint failed: users.email".into());
        let info = parse_duplicate_key(&sqlite).unwrap();
        assert_eq!(info.table, "users");
        assert_eq!(info.column, "email");

        let pg = ServiceError::QueryFailed(
            "duplicate key value violates unique constraint \"users_email_key\" \
             Key (email)=(a@b) already exists."
                .into(),
        );
        assert!(is_duplicate_key(&pg));
        let info = parse_duplicate_key(&pg).unwrap();
        assert_eq!(info.table, "users");
        assert_eq!(info.column, "email");
        assert_eq!(info.value, "a@b");

        let mssql = ServiceError::QueryFailed(
            "Violation of UNIQUE KEY constraint 'UQ_users_email'. Cannot insert \
             duplicate key in object 'dbo.users'. The duplicate key value is (a@b)."
                .into(),
        );
        assert!(is_duplicate_key(&mssql));
        let info = parse_duplicate_key(&mssql).unwrap();
        assert_eq!(info.table, "users");
        assert_eq!(info.column, "email");
        assert_eq!(info.value, "a@b");
    }

    #[test]
    fn test_non_duplicate_is_not_parsed() {
        let err = ServiceError::Validation("name required".into());
        assert!(parse_duplicate_key(&err).is_none());
    }

    #[test]
    fn test_force_retry_includes_not_found() {
        let err = ServiceError::NotFound("user 7".into());
        assert!(!should_retry(&err));
        assert!(should_force_retry(&err));
    }
}
