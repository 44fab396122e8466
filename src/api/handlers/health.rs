// Health probe handlers

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::sync::atomic::Ordering;

use crate::api::state::AppState;
use crate::cache::now_secs;
use crate::worker::WorkerHealthRow;

#[derive(Debug, Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
    pub timestamp: u64,
    pub uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub timestamp: u64,
    pub ready: bool,
}

#[derive(Debug, Serialize)]
pub struct WorkersResponse {
    pub timestamp: u64,
    pub workers: Vec<WorkerHealthRow>,
}

/// GET /api/v1/health/liveness: 200 whenever the process can answer.
pub async fn liveness(State(state): State<AppState>) -> Json<LivenessResponse> {
    let now = now_secs();
    Json(LivenessResponse {
        status: "alive",
        timestamp: now,
        uptime_seconds: now.saturating_sub(state.started_at),
    })
}

/// GET /api/v1/health/readiness: 200 once pools are up, 503 before.
pub async fn readiness(State(state): State<AppState>) -> Response {
    let ready = state.ready.load(Ordering::SeqCst);
    let body = Json(ReadinessResponse {
        status: if ready { "ready" } else { "starting" },
        timestamp: now_secs(),
        ready,
    });
    if ready {
        body.into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
    }
}

/// GET /api/v1/health/workers: the health table with pool gauges.
pub async fn workers(State(state): State<AppState>) -> Json<WorkersResponse> {
    Json(WorkersResponse {
        timestamp: now_secs(),
        workers: state.health.snapshot(),
    })
}
