// Item CRUD handlers

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::api::handlers::with_cache_tier;
use crate::api::state::AppState;
use crate::error::ServiceError;
use crate::repo::{ItemPatch, ListParams, NewItem};

/// POST /api/v1/items
pub async fn create_item(
    State(state): State<AppState>,
    Json(new): Json<NewItem>,
) -> Result<Response, ServiceError> {
    let item = state.items.create(new).await?;
    Ok((StatusCode::CREATED, Json(item)).into_response())
}

/// GET /api/v1/items/{id}
pub async fn get_item(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, ServiceError> {
    let (tier, item) = state.items.find(id).await?;
    Ok(with_cache_tier(Json(item).into_response(), tier))
}

/// GET /api/v1/items?page=&per_page=
pub async fn list_items(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Response, ServiceError> {
    let (tier, page) = state.items.list(params).await?;
    Ok(with_cache_tier(Json(page).into_response(), tier))
}

/// PUT /api/v1/items/{id}
pub async fn update_item(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(patch): Json<ItemPatch>,
) -> Result<Response, ServiceError> {
    let item = state.items.update(id, patch).await?;
    Ok(Json(item).into_response())
}

/// DELETE /api/v1/items/{id}
pub async fn delete_item(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ServiceError> {
    state.items.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
