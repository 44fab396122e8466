// Request middlewares
//
// Ordered outermost-in: task scope (installs the id that keys pool
// reentrancy), readiness gate, rate limiter, request logger. Each is an
// axum `from_fn` middleware over the shared state.

use axum::extract::{ConnectInfo, MatchedPath, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::net::SocketAddr;
use std::time::Instant;
use uuid::Uuid;

use crate::api::ratelimit::RateDecision;
use crate::api::state::AppState;
use crate::pool;
use crate::tasks::RecordMetricTask;

/// Paths that must answer even while the worker is warming up.
const GATE_EXEMPT: &[&str] = &["/api/v1/health/liveness", "/api/v1/health/readiness"];

/// Install a fresh task id for the whole request so every nested pool
/// checkout on this request shares one connection.
pub async fn task_scope(req: Request, next: Next) -> Response {
    let task_id = pool::next_task_id();
    pool::with_task_scope(task_id, next.run(req)).await
}

/// 503 immediately until the supervisor flips readiness.
pub async fn readiness_gate(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if !GATE_EXEMPT.contains(&path) && !state.ready.load(std::sync::atomic::Ordering::SeqCst) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": "SERVICE_UNAVAILABLE",
                "message": "worker is not ready",
            })),
        )
            .into_response();
    }
    next.run(req).await
}

/// Fixed-window limiter; emits the standard throttling headers.
pub async fn rate_limit(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    let ip = client_ip(req.headers(), &req);
    match state.rate_limiter.check(&path, &ip) {
        RateDecision::Exempt => next.run(req).await,
        RateDecision::Allowed {
            limit,
            remaining,
            reset,
        } => {
            let mut response = next.run(req).await;
            apply_headers(response.headers_mut(), limit, remaining, reset);
            response
        }
        RateDecision::Limited { limit, retry_after } => {
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": "RATE_LIMITED",
                    "message": "too many requests",
                })),
            )
                .into_response();
            apply_headers(response.headers_mut(), limit, 0, retry_after);
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert("Retry-After", value);
            }
            tracing::warn!(ip = %ip, path = %path, "rate limit tripped");
            response
        }
    }
}

/// Structured request log plus the fire-and-forget per-endpoint counter.
pub async fn request_logger(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let method = req.method().clone();
    let uri = req.uri().clone();
    // Counter keys come from the matched route so path params don't fan the
    // keyspace out.
    let endpoint = req
        .extensions()
        .get::<MatchedPath>()
        .map(|path| format!("{} {}", method, path.as_str()))
        .unwrap_or_else(|| format!("{} {}", method, uri.path()));
    let start = Instant::now();

    let response = next.run(req).await;

    let elapsed = start.elapsed();
    tracing::info!(
        request_id = %request_id,
        method = %method,
        uri = %uri,
        status = response.status().as_u16(),
        duration_ms = elapsed.as_millis() as u64,
        "request completed"
    );
    state.tasks.dispatch(RecordMetricTask { endpoint });
    response
}

fn apply_headers(headers: &mut HeaderMap, limit: u32, remaining: u32, reset: u64) {
    let pairs = [
        ("X-RateLimit-Limit", limit.to_string()),
        ("X-RateLimit-Remaining", remaining.to_string()),
        ("X-RateLimit-Reset", reset.to_string()),
    ];
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
}

/// Client identity: first X-Forwarded-For hop, else the socket peer.
fn client_ip(headers: &HeaderMap, req: &Request) -> String {
    if let Some(forwarded) = headers.get("X-Forwarded-For").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
