// Service configuration
//
// Plain config structs with defaults and environment overrides. Every section
// carries a validate() that is run once at startup before any pool is built.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::error::{Result, ServiceError};

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9501,
            request_timeout_secs: 30,
            enable_cors: true,
        }
    }
}

/// Sizing and retry settings shared by both pools
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Minimum number of connections to maintain
    pub min: usize,

    /// Maximum number of connections allowed
    pub max: usize,

    /// Fraction of max kept idle as headroom for the periodic auto-scaler
    pub idle_buffer: f64,

    /// Hysteresis margin around the idle buffer
    pub margin: f64,

    /// Timeout for acquiring a connection
    pub acquire_timeout_ms: u64,

    /// Retry budget for transient failures (-1 = unbounded)
    pub max_retries: i32,

    /// Base delay for exponential backoff
    pub retry_base_delay_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min: 2,
            max: 16,
            idle_buffer: 0.1,
            margin: 0.1,
            acquire_timeout_ms: 5_000,
            max_retries: 3,
            retry_base_delay_ms: 100,
        }
    }
}

impl PoolSettings {
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.min == 0 || self.min > self.max {
            return Err(ServiceError::Configuration(format!(
                "{}: require 0 < min ({}) <= max ({})",
                name, self.min, self.max
            )));
        }
        if !(self.idle_buffer > 0.0 && self.idle_buffer < 1.0) {
            return Err(ServiceError::Configuration(format!(
                "{}: idle_buffer must be in (0,1), got {}",
                name, self.idle_buffer
            )));
        }
        if !(self.margin > 0.0 && self.margin < 1.0) {
            return Err(ServiceError::Configuration(format!(
                "{}: margin must be in (0,1), got {}",
                name, self.margin
            )));
        }
        Ok(())
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// SQL connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub pool: PoolSettings,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5432,
            user: "swiftcrud".to_string(),
            password: "swiftcrud".to_string(),
            database: "swiftcrud".to_string(),
            pool: PoolSettings::default(),
        }
    }
}

impl SqlConfig {
    /// Key/value connection string for tokio-postgres.
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={}",
            self.host, self.port, self.user, self.password, self.database
        )
    }
}

/// KV store connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub database: i64,
    pub pool: PoolSettings,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            database: 0,
            pool: PoolSettings::default(),
        }
    }
}

impl KvConfig {
    /// Connection URL for the redis client.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.database
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

/// Two-tier cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// TTL for single-record entries
    pub record_ttl_secs: u64,

    /// TTL for list entries
    pub list_ttl_secs: u64,

    /// TTL used when warming the local tier from a remote hit
    pub local_warm_ttl_secs: u64,

    /// Capacity of the local bounded table
    pub local_max_entries: usize,

    /// Maximum local key length; longer keys are truncated
    pub local_key_max: usize,

    /// How many stale list versions survive a GC sweep
    pub gc_keep_versions: u64,

    /// How many LRU-head rows a single local GC pass examines
    pub gc_check_count: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            record_ttl_secs: 3_000,
            list_ttl_secs: 1_200,
            local_warm_ttl_secs: 120,
            local_max_entries: 8_192,
            local_key_max: 56,
            gc_keep_versions: 2,
            gc_check_count: 128,
        }
    }
}

impl CacheSettings {
    pub fn validate(&self) -> Result<()> {
        if self.local_max_entries == 0 {
            return Err(ServiceError::Configuration(
                "cache: local_max_entries must be greater than 0".to_string(),
            ));
        }
        if self.local_key_max == 0 {
            return Err(ServiceError::Configuration(
                "cache: local_key_max must be greater than 0".to_string(),
            ));
        }
        if self.record_ttl_secs == 0 || self.list_ttl_secs == 0 {
            return Err(ServiceError::Configuration(
                "cache: TTLs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Fixed-window rate limiter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Requests allowed per window and client IP
    pub throttle: u32,

    /// Window length in seconds
    pub window_secs: u64,

    /// Paths that bypass the limiter (exact match)
    pub exclude_paths: Vec<String>,

    /// Client IPs matching this pattern bypass the limiter
    pub skip_ip_pattern: Option<String>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            throttle: 100,
            window_secs: 60,
            exclude_paths: vec![
                "/api/v1/health/liveness".to_string(),
                "/api/v1/health/readiness".to_string(),
            ],
            skip_ip_pattern: None,
        }
    }
}

impl RateLimitSettings {
    pub fn validate(&self) -> Result<()> {
        if self.throttle == 0 || self.window_secs == 0 {
            return Err(ServiceError::Configuration(
                "rate_limit: throttle and window_secs must be greater than 0".to_string(),
            ));
        }
        if let Some(pattern) = &self.skip_ip_pattern {
            regex::Regex::new(pattern).map_err(|e| {
                ServiceError::Configuration(format!("rate_limit: bad skip_ip_pattern: {}", e))
            })?;
        }
        Ok(())
    }
}

/// Top-level service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub sql: SqlConfig,
    pub kv: KvConfig,
    pub cache: CacheSettings,
    pub rate_limit: RateLimitSettings,
}

impl ServiceConfig {
    /// Defaults overridden by SWIFTCRUD_* environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        read_env("SWIFTCRUD_HOST", &mut config.server.host);
        read_env_parsed("SWIFTCRUD_PORT", &mut config.server.port)?;
        read_env_parsed("SWIFTCRUD_ENABLE_CORS", &mut config.server.enable_cors)?;
        read_env_parsed(
            "SWIFTCRUD_REQUEST_TIMEOUT_SECS",
            &mut config.server.request_timeout_secs,
        )?;

        read_env("SWIFTCRUD_SQL_HOST", &mut config.sql.host);
        read_env_parsed("SWIFTCRUD_SQL_PORT", &mut config.sql.port)?;
        read_env("SWIFTCRUD_SQL_USER", &mut config.sql.user);
        read_env("SWIFTCRUD_SQL_PASSWORD", &mut config.sql.password);
        read_env("SWIFTCRUD_SQL_DATABASE", &mut config.sql.database);
        read_env_parsed("SWIFTCRUD_SQL_POOL_MIN", &mut config.sql.pool.min)?;
        read_env_parsed("SWIFTCRUD_SQL_POOL_MAX", &mut config.sql.pool.max)?;

        read_env("SWIFTCRUD_KV_HOST", &mut config.kv.host);
        read_env_parsed("SWIFTCRUD_KV_PORT", &mut config.kv.port)?;
        if let Ok(password) = env::var("SWIFTCRUD_KV_PASSWORD") {
            config.kv.password = Some(password);
        }
        read_env_parsed("SWIFTCRUD_KV_POOL_MIN", &mut config.kv.pool.min)?;
        read_env_parsed("SWIFTCRUD_KV_POOL_MAX", &mut config.kv.pool.max)?;

        read_env_parsed("SWIFTCRUD_RATE_LIMIT", &mut config.rate_limit.throttle)?;
        read_env_parsed(
            "SWIFTCRUD_RATE_WINDOW_SECS",
            &mut config.rate_limit.window_secs,
        )?;
        if let Ok(pattern) = env::var("SWIFTCRUD_RATE_SKIP_IP_PATTERN") {
            config.rate_limit.skip_ip_pattern = Some(pattern);
        }

        read_env_parsed(
            "SWIFTCRUD_CACHE_LOCAL_MAX_ENTRIES",
            &mut config.cache.local_max_entries,
        )?;
        read_env_parsed(
            "SWIFTCRUD_CACHE_RECORD_TTL_SECS",
            &mut config.cache.record_ttl_secs,
        )?;
        read_env_parsed(
            "SWIFTCRUD_CACHE_LIST_TTL_SECS",
            &mut config.cache.list_ttl_secs,
        )?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.sql.pool.validate("sql pool")?;
        self.kv.pool.validate("kv pool")?;
        self.cache.validate()?;
        self.rate_limit.validate()?;
        Ok(())
    }
}

fn read_env(name: &str, target: &mut String) {
    if let Ok(value) = env::var(name) {
        *target = value;
    }
}

fn read_env_parsed<T: std::str::FromStr>(name: &str, target: &mut T) -> Result<()> {
    if let Ok(value) = env::var(name) {
        *target = value.parse().map_err(|_| {
            ServiceError::Configuration(format!("{}: cannot parse {:?}", name, value))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rate_limit.throttle, 100);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.cache.record_ttl_secs, 3_000);
        assert_eq!(config.cache.list_ttl_secs, 1_200);
        assert_eq!(config.cache.local_key_max, 56);
    }

    #[test]
    fn test_pool_settings_validation() {
        let mut pool = PoolSettings::default();
        pool.min = 0;
        assert!(pool.validate("sql pool").is_err());

        pool.min = 8;
        pool.max = 4;
        assert!(pool.validate("sql pool").is_err());

        pool.min = 2;
        pool.max = 4;
        pool.idle_buffer = 1.5;
        assert!(pool.validate("sql pool").is_err());

        pool.idle_buffer = 0.1;
        assert!(pool.validate("sql pool").is_ok());
    }

    #[test]
    fn test_bad_skip_pattern_rejected() {
        let mut limits = RateLimitSettings::default();
        limits.skip_ip_pattern = Some("10\\.0\\.(".to_string());
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_connection_strings() {
        let sql = SqlConfig::default();
        assert!(sql.connection_string().contains("host=127.0.0.1"));
        assert!(sql.connection_string().contains("dbname=swiftcrud"));

        let kv = KvConfig::default();
        assert_eq!(kv.url(), "redis://127.0.0.1:6379/0");

        let kv = KvConfig {
            password: Some("s3cret".to_string()),
            ..KvConfig::default()
        };
        assert_eq!(kv.url(), "redis://:s3cret@127.0.0.1:6379/0");
    }
}
