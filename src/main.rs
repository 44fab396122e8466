// # SwiftCRUD Server
//
// Entry point: load configuration, bring the worker up through the
// supervisor (pools first, readiness last), and serve HTTP until a
// shutdown signal lands.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use swift_crud::api::{ApiServer, AppState, RateLimiter};
use swift_crud::cache::{LocalCache, RemoteCache, TwoTierCache};
use swift_crud::pool::{KvConnector, KvPool, SqlConnector, SqlPool};
use swift_crud::repo::{ItemRepository, UserRepository};
use swift_crud::tasks::{TaskContext, TaskQueue};
use swift_crud::worker::{HealthTable, WorkerSupervisor};
use swift_crud::{Result, ServiceConfig, VERSION};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let config = ServiceConfig::from_env()?;
    info!(version = VERSION, "starting swift-crud");

    let sql_pool = Arc::new(SqlPool::new(
        "sql",
        config.sql.pool.clone(),
        SqlConnector::new(config.sql.clone()),
    ));
    let kv_pool = Arc::new(KvPool::new(
        "kv",
        config.kv.pool.clone(),
        KvConnector::new(&config.kv)?,
    ));

    let local = LocalCache::new(config.cache.clone());
    let remote = RemoteCache::new(Arc::clone(&kv_pool), config.cache.clone());
    let cache = Arc::new(TwoTierCache::new(
        local.clone(),
        remote,
        config.cache.clone(),
        vec!["users", "items"],
    ));

    let health = Arc::new(HealthTable::new());
    let supervisor = WorkerSupervisor::new(
        1,
        Arc::clone(&sql_pool),
        Arc::clone(&kv_pool),
        Arc::clone(&cache),
        Arc::clone(&health),
    );

    let (tasks, _task_worker) = TaskQueue::start(TaskContext {
        cache: Arc::clone(&cache),
        sql: Arc::clone(&sql_pool),
    });

    let started_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let state = AppState {
        config: Arc::new(config.clone()),
        sql_pool: Arc::clone(&sql_pool),
        kv_pool: Arc::clone(&kv_pool),
        cache: Arc::clone(&cache),
        users: UserRepository::new(
            Arc::clone(&sql_pool),
            Arc::clone(&cache),
            tasks.clone(),
        ),
        items: ItemRepository::new(
            Arc::clone(&sql_pool),
            Arc::clone(&cache),
            tasks.clone(),
        ),
        rate_limiter: Arc::new(RateLimiter::new(local, &config.rate_limit)),
        tasks,
        health,
        ready: supervisor.ready_flag(),
        started_at,
    };

    // Serve immediately; the readiness gate answers 503 until the
    // supervisor finishes pool init.
    {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move {
            if let Err(err) = supervisor.start().await {
                error!(error = %err, "worker startup failed");
            }
        });
    }

    let server = ApiServer::new(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    tokio::select! {
        result = server.run(&addr) => {
            if let Err(err) = result {
                error!(error = %err, "http server stopped");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    supervisor.stop();
    info!("shutdown complete");
    Ok(())
}
