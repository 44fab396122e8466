// # HTTP Surface
//
// Router assembly and the request-entry contract: every request gets a task
// scope, passes the readiness gate and the fixed-window rate limiter, and
// is logged with its latency. The core contributes throttling headers,
// 429/503 mapping, and the opt-in X-Cache-Type header; routes themselves
// are thin delegates into the repositories.

pub mod handlers;
pub mod middleware;
pub mod ratelimit;
pub mod state;

pub use ratelimit::{RateDecision, RateLimiter};
pub use state::AppState;

use axum::http::Method;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::error::{Result, ServiceError};

pub struct ApiServer {
    state: AppState,
}

impl ApiServer {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Build the router with all endpoints and the middleware stack.
    pub fn router(&self) -> Router {
        let state = self.state.clone();

        let mut router = Router::new()
            .route(
                "/api/v1/health/liveness",
                get(handlers::health::liveness),
            )
            .route(
                "/api/v1/health/readiness",
                get(handlers::health::readiness),
            )
            .route("/api/v1/health/workers", get(handlers::health::workers))
            .route(
                "/api/v1/users",
                get(handlers::users::list_users).post(handlers::users::create_user),
            )
            .route(
                "/api/v1/users/{id}",
                get(handlers::users::get_user)
                    .put(handlers::users::update_user)
                    .delete(handlers::users::delete_user),
            )
            .route(
                "/api/v1/items",
                get(handlers::items::list_items).post(handlers::items::create_item),
            )
            .route(
                "/api/v1/items/{id}",
                get(handlers::items::get_item)
                    .put(handlers::items::update_item)
                    .delete(handlers::items::delete_item),
            )
            // Innermost first: logger, limiter, readiness gate, task scope.
            .layer(axum::middleware::from_fn_with_state(
                state.clone(),
                middleware::request_logger,
            ))
            .layer(axum::middleware::from_fn_with_state(
                state.clone(),
                middleware::rate_limit,
            ))
            .layer(axum::middleware::from_fn_with_state(
                state.clone(),
                middleware::readiness_gate,
            ))
            .layer(axum::middleware::from_fn(middleware::task_scope))
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(Duration::from_secs(
                state.config.server.request_timeout_secs,
            )))
            .with_state(state.clone());

        if state.config.server.enable_cors {
            let cors = CorsLayer::new()
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
                .allow_headers(Any)
                .allow_origin(Any);
            router = router.layer(cors);
        }

        router
    }

    /// Bind and serve until the process is told to stop.
    pub async fn run(&self, addr: &str) -> Result<()> {
        let router = self.router();
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ServiceError::Unavailable(format!("failed to bind {}: {}", addr, e)))?;
        tracing::info!(addr, "http server listening");
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .map_err(|e| ServiceError::Internal(format!("server error: {}", e)))?;
        Ok(())
    }
}
