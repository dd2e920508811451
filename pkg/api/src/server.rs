use axum::{
    Router, middleware,
    routing::{get, post},
};
use pkg_constants::network::HTTP_DRAIN_TIMEOUT_SECS;
use pkg_controllers::{ControllerConfig, ControllerManager};
use pkg_metrics::{MetricsRegistry, MetricsSink};
use pkg_scheduler::{RoundRobinScheduler, SchedulingLoop};
use pkg_state::Store;
use pkg_types::ControlError;
use pkg_types::event::{EventSink, FanoutSink, TracingSink};
use pkg_types::node::Node;
use pkg_types::replicaset::ReplicaSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::AppState;
use crate::handlers::{health, pods, replicasets, watch as watch_handler};
use crate::request_id::request_id_middleware;
use crate::service::ReplicaSetService;

/// Server configuration passed from the binary's CLI.
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub controller: ControllerConfig,
    pub scheduler_retry: Duration,
    pub nodes: Vec<Node>,
    /// ReplicaSets created before the controllers start. Existing names are skipped.
    pub manifests: Vec<ReplicaSet>,
}

pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route(
            "/api/v1/replicasets",
            post(replicasets::create_replicaset).get(replicasets::list_replicasets),
        )
        .route(
            "/api/v1/replicasets/{name}",
            get(replicasets::get_replicaset)
                .put(replicasets::update_replicaset)
                .delete(replicasets::delete_replicaset),
        )
        .route(
            "/api/v1/replicasets/{name}/status",
            get(replicasets::replicaset_status),
        )
        .route("/api/v1/pods", get(pods::list_pods))
        .route("/api/v1/watch", get(watch_handler::watch_events))
        .route_layer(middleware::from_fn(request_id_middleware));

    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/metrics", get(health::metrics))
        .merge(api_routes)
        .with_state(state)
}

/// A running control plane: store, controllers, scheduler and HTTP API.
pub struct Server {
    addr: SocketAddr,
    store: Store,
    manager: ControllerManager,
    shutdown_tx: watch::Sender<bool>,
    scheduler: JoinHandle<()>,
    http: JoinHandle<std::io::Result<()>>,
}

impl Server {
    pub async fn start(config: ServerConfig) -> anyhow::Result<Self> {
        let store = Store::new();
        let registry = Arc::new(MetricsRegistry::with_defaults());
        let sinks: Vec<Arc<dyn EventSink>> = vec![
            Arc::new(TracingSink),
            Arc::new(MetricsSink::new(registry.clone())),
        ];
        let max_conflict_retries = config.controller.max_conflict_retries;
        let mut manager = ControllerManager::new(
            store.clone(),
            config.controller,
            Arc::new(FanoutSink::new(sinks)),
        );
        let service = ReplicaSetService::new(store.clone(), manager.statuses())
            .with_max_conflict_retries(max_conflict_retries);

        let listener = TcpListener::bind(config.addr).await?;
        let addr = listener.local_addr()?;

        seed_manifests(&service, config.manifests).await?;
        manager.start().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        info!("Scheduler nodes: {}", config.nodes.len());
        let assigner = Arc::new(RoundRobinScheduler::new(config.nodes));
        let scheduler = tokio::spawn(
            SchedulingLoop::new(store.clone(), assigner, config.scheduler_retry)
                .run(shutdown_rx.clone()),
        );

        let state = AppState {
            service,
            store: store.clone(),
            queue: manager.queue(),
            metrics: registry,
        };
        let app = build_router(state);

        info!("Starting API server on {}", addr);
        let mut http_shutdown = shutdown_rx;
        let http = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = http_shutdown.wait_for(|stop| *stop).await;
                })
                .await
        });

        Ok(Self {
            addr,
            store,
            manager,
            shutdown_tx,
            scheduler,
            http,
        })
    }

    /// The bound address (useful when started on port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn store(&self) -> Store {
        self.store.clone()
    }

    /// Stop accepting requests, drain the controllers, then close the store.
    pub async fn shutdown(self) {
        info!("Shutting down");
        self.shutdown_tx.send_replace(true);

        // Open watch streams would hold graceful shutdown forever.
        let mut http = self.http;
        let drain = Duration::from_secs(HTTP_DRAIN_TIMEOUT_SECS);
        match tokio::time::timeout(drain, &mut http).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!("API server error: {}", e),
            Ok(Err(e)) => warn!("API server task ended abnormally: {}", e),
            Err(_) => {
                warn!(
                    "API connections still open after {}s, closing them",
                    HTTP_DRAIN_TIMEOUT_SECS
                );
                http.abort();
            }
        }
        self.manager.shutdown().await;
        if let Err(e) = self.scheduler.await {
            warn!("Scheduler task ended abnormally: {}", e);
        }
        self.store.close().await;
        info!("Shutdown complete");
    }
}

/// Run until `signal` resolves, then shut down gracefully.
pub async fn start_server<F>(config: ServerConfig, signal: F) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    let server = Server::start(config).await?;
    signal.await;
    server.shutdown().await;
    Ok(())
}

async fn seed_manifests(
    service: &ReplicaSetService,
    manifests: Vec<ReplicaSet>,
) -> anyhow::Result<()> {
    for rs in manifests {
        let name = rs.name.clone();
        match service.create_replicaset(rs).await {
            Ok(_) => info!("Seeded replicaset: {}", name),
            Err(ControlError::AlreadyExists { .. }) => {
                info!("Replicaset {} already exists, skipping", name)
            }
            Err(e) => return Err(anyhow::anyhow!("Invalid manifest {}: {}", name, e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::pod::{Pod, PodPhase, PodTemplate};
    use pkg_types::replicaset::{ReplicaSetSpec, ReplicaSetStatus};
    use serde_json::json;
    use std::collections::HashMap;

    fn make_rs(name: &str, replicas: u32) -> ReplicaSet {
        let labels = HashMap::from([("app".to_string(), name.to_string())]);
        ReplicaSet {
            name: name.to_string(),
            spec: ReplicaSetSpec {
                replicas,
                selector: labels.clone(),
                template: PodTemplate {
                    image: "nginx:1.27".to_string(),
                    labels,
                    node_affinity: HashMap::new(),
                },
            },
            metadata: Default::default(),
        }
    }

    fn test_config(manifests: Vec<ReplicaSet>) -> ServerConfig {
        ServerConfig {
            addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            controller: ControllerConfig {
                workers: 2,
                resync_interval: Duration::from_millis(200),
                backoff_base: Duration::from_millis(10),
                backoff_max: Duration::from_millis(100),
                max_conflict_retries: 3,
            },
            scheduler_retry: Duration::from_millis(50),
            nodes: vec![Node::new("node-1"), Node::new("node-2").with_label("disk", "ssd")],
            manifests,
        }
    }

    async fn wait_for_status<F>(
        client: &reqwest::Client,
        base: &str,
        name: &str,
        check: F,
    ) -> ReplicaSetStatus
    where
        F: Fn(&ReplicaSetStatus) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let status: ReplicaSetStatus = client
                .get(format!("{}/api/v1/replicasets/{}/status", base, name))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if check(&status) {
                return status;
            }
            assert!(tokio::time::Instant::now() < deadline, "status never converged: {:?}", status);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_end_to_end_lifecycle() {
        let server = Server::start(test_config(vec![make_rs("seeded", 1)])).await.unwrap();
        let base = format!("http://{}", server.local_addr());
        let client = reqwest::Client::new();

        let health = client.get(format!("{}/healthz", base)).send().await.unwrap();
        assert_eq!(health.status(), 200);

        let created = client
            .post(format!("{}/api/v1/replicasets", base))
            .json(&make_rs("web", 3))
            .send()
            .await
            .unwrap();
        assert_eq!(created.status(), 201);
        assert!(created.headers().contains_key("x-request-id"));

        let status = wait_for_status(&client, &base, "web", |s| s.running == 3).await;
        assert_eq!(status.live, 3);
        assert!(status.last_error.is_none());
        wait_for_status(&client, &base, "seeded", |s| s.running == 1).await;

        let scaled = client
            .put(format!("{}/api/v1/replicasets/web", base))
            .json(&json!({ "replicas": 1 }))
            .send()
            .await
            .unwrap();
        assert_eq!(scaled.status(), 200);
        wait_for_status(&client, &base, "web", |s| s.live == 1).await;

        let pods: Vec<Pod> = client
            .get(format!("{}/api/v1/pods?owner=web", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].phase, PodPhase::Running);
        assert!(pods[0].node_name.is_some());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let metrics = client
                .get(format!("{}/metrics", base))
                .send()
                .await
                .unwrap()
                .text()
                .await
                .unwrap();
            if metrics.contains(
                "replicore_reconcile_actions_total{action=\"delete\",result=\"success\"} 2\n",
            ) {
                assert!(metrics.contains("replicore_replicasets 2\n"));
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "metrics missing deletes:\n{}",
                metrics
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let deleted = client
            .delete(format!("{}/api/v1/replicasets/web", base))
            .send()
            .await
            .unwrap();
        assert_eq!(deleted.status(), 200);
        let missing = client
            .get(format!("{}/api/v1/replicasets/web", base))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);

        let store = server.store();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !store
            .list_pods(&pkg_types::selector::Selector::owned_by("web"))
            .await
            .unwrap()
            .is_empty()
        {
            assert!(tokio::time::Instant::now() < deadline, "pods were not cascaded");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        server.shutdown().await;
        assert!(store.is_closed().await);
    }

    #[tokio::test]
    async fn test_error_responses() {
        let server = Server::start(test_config(vec![])).await.unwrap();
        let base = format!("http://{}", server.local_addr());
        let client = reqwest::Client::new();

        let invalid = client
            .post(format!("{}/api/v1/replicasets", base))
            .json(&make_rs("Not_Valid", 1))
            .send()
            .await
            .unwrap();
        assert_eq!(invalid.status(), 422);
        let body: serde_json::Value = invalid.json().await.unwrap();
        assert_eq!(body["error"], "validation");

        client
            .post(format!("{}/api/v1/replicasets", base))
            .json(&make_rs("web", 0))
            .send()
            .await
            .unwrap();
        let duplicate = client
            .post(format!("{}/api/v1/replicasets", base))
            .json(&make_rs("web", 0))
            .send()
            .await
            .unwrap();
        assert_eq!(duplicate.status(), 409);

        let bad_kind = client
            .get(format!("{}/api/v1/watch?kind=services", base))
            .send()
            .await
            .unwrap();
        assert_eq!(bad_kind.status(), 422);

        server.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unschedulable_surfaces_in_status() {
        let server = Server::start(test_config(vec![])).await.unwrap();
        let base = format!("http://{}", server.local_addr());
        let client = reqwest::Client::new();

        let mut rs = make_rs("gpu", 1);
        rs.spec
            .template
            .node_affinity
            .insert("gpu".to_string(), "true".to_string());
        client
            .post(format!("{}/api/v1/replicasets", base))
            .json(&rs)
            .send()
            .await
            .unwrap();

        let status = wait_for_status(&client, &base, "gpu", |s| s.last_error.is_some()).await;
        assert_eq!(status.pending, 1);
        assert!(status.last_error.unwrap().contains("node affinity"));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_watch_streams_events() {
        let server = Server::start(test_config(vec![])).await.unwrap();
        let base = format!("http://{}", server.local_addr());
        let client = reqwest::Client::new();

        let mut stream = client
            .get(format!("{}/api/v1/watch?kind=replicasets", base))
            .send()
            .await
            .unwrap();
        assert_eq!(stream.status(), 200);

        client
            .post(format!("{}/api/v1/replicasets", base))
            .json(&make_rs("web", 0))
            .send()
            .await
            .unwrap();

        let mut received = String::new();
        while !received.contains("\"name\":\"web\"") {
            let chunk = tokio::time::timeout(Duration::from_secs(3), stream.chunk())
                .await
                .expect("no watch event")
                .unwrap()
                .expect("stream ended");
            received.push_str(&String::from_utf8_lossy(&chunk));
        }
        assert!(received.contains("event: added"));

        drop(stream);
        server.shutdown().await;
    }
}
