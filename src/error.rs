use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("pool not initialized")]
    PoolNotInitialized,

    #[error("pool exhausted: {in_use} in use of {max} after {waited_ms}ms")]
    PoolExhausted {
        in_use: usize,
        max: usize,
        waited_ms: u64,
    },

    #[error("pool closed")]
    PoolClosed,

    #[error("connection creation failed: {0}")]
    CreateFailed(String),

    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("duplicate key on {table}.{column}: {value}")]
    DuplicateKey {
        table: String,
        column: String,
        value: String,
    },

    #[error("cache full: {0}")]
    CacheFull(String),

    #[error("rate limited: retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sql error: {0}")]
    Sql(#[from] tokio_postgres::Error),

    #[error("kv error: {0}")]
    Kv(#[from] redis::RedisError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ServiceError>;

impl ServiceError {
    /// Machine-readable error code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::PoolNotInitialized => "POOL_NOT_INITIALIZED",
            ServiceError::PoolExhausted { .. } => "POOL_EXHAUSTED",
            ServiceError::PoolClosed => "POOL_CLOSED",
            ServiceError::CreateFailed(_) => "CREATE_FAILED",
            ServiceError::QueryFailed(_) => "QUERY_FAILED",
            ServiceError::DuplicateKey { .. } => "DUPLICATE_KEY",
            ServiceError::CacheFull(_) => "CACHE_FULL",
            ServiceError::RateLimited { .. } => "RATE_LIMITED",
            ServiceError::Unavailable(_) => "SERVICE_UNAVAILABLE",
            ServiceError::Validation(_) => "VALIDATION",
            ServiceError::NotFound(_) => "NOT_FOUND",
            ServiceError::Configuration(_) => "CONFIGURATION",
            ServiceError::Timeout(_) => "TIMEOUT",
            ServiceError::Serialization(_) => "SERIALIZATION",
            ServiceError::Sql(_) => "SQL",
            ServiceError::Kv(_) => "KV",
            ServiceError::Io(_) => "IO",
            ServiceError::Internal(_) => "INTERNAL",
        }
    }

    /// HTTP status for the wire taxonomy.
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::PoolExhausted { .. }
            | ServiceError::PoolNotInitialized
            | ServiceError::PoolClosed
            | ServiceError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ServiceError::DuplicateKey { .. } => StatusCode::CONFLICT,
            ServiceError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
        };
        let mut response = (status, Json(body)).into_response();
        if let ServiceError::RateLimited { retry_after } = self {
            if let Ok(value) = retry_after.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ServiceError::PoolExhausted {
                in_use: 10,
                max: 10,
                waited_ms: 1000
            }
            .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ServiceError::RateLimited { retry_after: 57 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ServiceError::DuplicateKey {
                table: "users".into(),
                column: "email".into(),
                value: "a@b".into()
            }
            .status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::NotFound("user 1".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::Internal("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ServiceError::PoolNotInitialized.code(), "POOL_NOT_INITIALIZED");
        assert_eq!(ServiceError::CacheFull("x".into()).code(), "CACHE_FULL");
    }
}
