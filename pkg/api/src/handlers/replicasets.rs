use axum::{
    Json,
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::IntoResponse,
};
use pkg_types::replicaset::{ReplicaSet, ReplicaSetUpdate};

use crate::AppState;
use crate::error::ApiError;

/// POST /api/v1/replicasets
pub async fn create_replicaset(
    State(state): State<AppState>,
    Json(rs): Json<ReplicaSet>,
) -> Result<impl IntoResponse, ApiError> {
    let created = state.service.create_replicaset(rs).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /api/v1/replicasets
pub async fn list_replicasets(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.list_replicasets().await?))
}

pub async fn get_replicaset(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.get_replicaset(&name).await?))
}

/// PUT /api/v1/replicasets/{name}: body is a partial update (replicas and/or template).
pub async fn update_replicaset(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
    Json(update): Json<ReplicaSetUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.update_replicaset(&name, update).await?))
}

pub async fn delete_replicaset(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.delete_replicaset(&name).await?))
}

pub async fn replicaset_status(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.replicaset_status(&name).await?))
}
