// User CRUD handlers

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::api::handlers::with_cache_tier;
use crate::api::state::AppState;
use crate::error::ServiceError;
use crate::repo::{ListParams, NewUser, UserPatch};

/// POST /api/v1/users
pub async fn create_user(
    State(state): State<AppState>,
    Json(new): Json<NewUser>,
) -> Result<Response, ServiceError> {
    let user = state.users.create(new).await?;
    Ok((StatusCode::CREATED, Json(user)).into_response())
}

/// GET /api/v1/users/{id}
pub async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, ServiceError> {
    let (tier, user) = state.users.find(id).await?;
    Ok(with_cache_tier(Json(user).into_response(), tier))
}

/// GET /api/v1/users?page=&per_page=
pub async fn list_users(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Response, ServiceError> {
    let (tier, page) = state.users.list(params).await?;
    Ok(with_cache_tier(Json(page).into_response(), tier))
}

/// PUT /api/v1/users/{id}
pub async fn update_user(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(patch): Json<UserPatch>,
) -> Result<Response, ServiceError> {
    let user = state.users.update(id, patch).await?;
    Ok(Json(user).into_response())
}

/// DELETE /api/v1/users/{id}
pub async fn delete_user(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ServiceError> {
    state.users.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
