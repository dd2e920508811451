use axum::{
    Json,
    extract::{Query, State},
    response::IntoResponse,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct PodQuery {
    #[serde(default)]
    pub owner: Option<String>,
}

/// GET /api/v1/pods?owner=<replicaset>
pub async fn list_pods(
    State(state): State<AppState>,
    Query(query): Query<PodQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let pods = state.service.list_pods(query.owner.as_deref()).await?;
    Ok(Json(pods))
}
