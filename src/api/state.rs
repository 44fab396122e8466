// Shared handler state

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::api::ratelimit::RateLimiter;
use crate::cache::TwoTierCache;
use crate::config::ServiceConfig;
use crate::pool::{KvPool, SqlPool};
use crate::repo::{ItemRepository, UserRepository};
use crate::tasks::TaskQueue;
use crate::worker::HealthTable;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub sql_pool: Arc<SqlPool>,
    pub kv_pool: Arc<KvPool>,
    pub cache: Arc<TwoTierCache>,
    pub users: UserRepository,
    pub items: ItemRepository,
    pub rate_limiter: Arc<RateLimiter>,
    pub tasks: TaskQueue,
    pub health: Arc<HealthTable>,
    /// Per-worker readiness flag owned by the supervisor.
    pub ready: Arc<AtomicBool>,
    pub started_at: u64,
}
