pub mod error;
pub mod handlers;
pub mod request_id;
pub mod server;
pub mod service;

use std::sync::Arc;

use pkg_controllers::workqueue::WorkQueue;
use pkg_metrics::MetricsRegistry;
use pkg_state::Store;

use crate::service::ReplicaSetService;

/// Shared application state injected into all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: ReplicaSetService,
    pub store: Store,
    pub queue: WorkQueue,
    pub metrics: Arc<MetricsRegistry>,
}
