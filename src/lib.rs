// SwiftCRUD - high-throughput HTTP CRUD microservice
//
// The interesting part is the substrate under the endpoints: bounded
// auto-scaling connection pools for SQL and KV backends, a two-tier cache
// with version-token list invalidation, a fixed-window rate limiter, and a
// worker supervision loop with heartbeat and GC tickers.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod pool;
pub mod repo;
pub mod tasks;
pub mod worker;

pub use config::ServiceConfig;
pub use error::{Result, ServiceError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
