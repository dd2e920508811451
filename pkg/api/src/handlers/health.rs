use axum::{
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};
use pkg_metrics::{PODS, REPLICASETS, STORE_REVISION, WORKQUEUE_DEPTH};
use pkg_types::Kind;
use pkg_types::selector::Selector;

use crate::AppState;
use crate::error::ApiError;

/// GET /healthz: 200 while the store is open.
pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    if state.store.is_closed().await {
        (StatusCode::SERVICE_UNAVAILABLE, "store closed")
    } else {
        (StatusCode::OK, "ok")
    }
}

/// GET /metrics: gauges are sampled at scrape time.
pub async fn metrics(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let everything = Selector::everything();
    let replicasets = state.store.list(Kind::ReplicaSet, &everything).await?.len();
    let pods = state.store.list(Kind::Pod, &everything).await?.len();

    let registry = &state.metrics;
    registry.gauge_set(REPLICASETS, replicasets as i64);
    registry.gauge_set(PODS, pods as i64);
    registry.gauge_set(WORKQUEUE_DEPTH, state.queue.len() as i64);
    registry.gauge_set(STORE_REVISION, state.store.revision().await as i64);

    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        registry.render(),
    ))
}
