use pkg_constants::controller::{
    DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_MAX_SECS, DEFAULT_MAX_CONFLICT_RETRIES,
    DEFAULT_RESYNC_INTERVAL_SECS, DEFAULT_WORKERS,
};
use pkg_state::Store;
use pkg_types::Result;
use pkg_types::event::EventSink;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::informer::Informer;
use crate::replicaset::ReplicaSetController;
use crate::status::StatusCache;
use crate::workqueue::{ExponentialBackoff, WorkQueue};

/// Tunables for the reconciliation pipeline.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub workers: usize,
    pub resync_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_conflict_retries: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            resync_interval: Duration::from_secs(DEFAULT_RESYNC_INTERVAL_SECS),
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            backoff_max: Duration::from_secs(DEFAULT_BACKOFF_MAX_SECS),
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        }
    }
}

/// Wires the informer, work queue and a fixed pool of reconcile workers.
pub struct ControllerManager {
    config: ControllerConfig,
    queue: WorkQueue,
    informer: Informer,
    controller: Arc<ReplicaSetController>,
    statuses: StatusCache,
    informer_handle: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl ControllerManager {
    pub fn new(store: Store, config: ControllerConfig, sink: Arc<dyn EventSink>) -> Self {
        let queue = WorkQueue::new(ExponentialBackoff::new(
            config.backoff_base,
            config.backoff_max,
        ));
        let informer = Informer::new(store.clone(), queue.clone());
        let controller = Arc::new(
            ReplicaSetController::new(store, sink)
                .with_max_conflict_retries(config.max_conflict_retries),
        );
        Self {
            config,
            queue,
            informer,
            controller,
            statuses: StatusCache::new(),
            informer_handle: None,
            workers: Vec::new(),
        }
    }

    pub fn queue(&self) -> WorkQueue {
        self.queue.clone()
    }

    pub fn statuses(&self) -> StatusCache {
        self.statuses.clone()
    }

    /// Start the informer, then the workers.
    pub async fn start(&mut self) -> Result<()> {
        let handle = self.informer.start(self.config.resync_interval).await?;
        self.informer_handle = Some(handle);

        let workers = self.config.workers.max(1);
        for id in 0..workers {
            self.workers.push(tokio::spawn(run_worker(
                id,
                self.queue.clone(),
                self.controller.clone(),
                self.statuses.clone(),
            )));
        }
        info!(
            "ControllerManager started (workers={}, resync={}s, backoff={}ms..{}s)",
            workers,
            self.config.resync_interval.as_secs(),
            self.config.backoff_base.as_millis(),
            self.config.backoff_max.as_secs()
        );
        Ok(())
    }

    /// Stop the informer, let in-flight reconciliations finish, then join
    /// every task.
    pub async fn shutdown(mut self) {
        info!("ControllerManager shutting down");
        self.informer.stop();
        self.queue.shut_down_with_drain().await;

        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                warn!("Reconcile worker ended abnormally: {}", e);
            }
        }
        if let Some(handle) = self.informer_handle.take()
            && let Err(e) = handle.await
        {
            warn!("Informer task ended abnormally: {}", e);
        }
        info!("ControllerManager stopped");
    }
}

async fn run_worker(
    id: usize,
    queue: WorkQueue,
    controller: Arc<ReplicaSetController>,
    statuses: StatusCache,
) {
    while let Ok((key, token)) = queue.get().await {
        match controller.reconcile_once(&key).await {
            Ok(outcome) => {
                queue.forget(&key);
                if outcome.owner_gone {
                    statuses.remove(&key);
                } else {
                    statuses.record_success(&key);
                }
            }
            Err(e) if e.is_fatal() => {
                error!("worker {}: {} while reconciling {}, halting worker", id, e, key);
                statuses.record_failure(&key, &e);
                queue.done(token);
                return;
            }
            Err(e) => {
                statuses.record_failure(&key, &e);
                queue.add_rate_limited(&key);
                warn!(
                    "worker {}: reconcile of {} failed ({} consecutive): {}",
                    id,
                    key,
                    queue.num_requeues(&key),
                    e
                );
            }
        }
        queue.done(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::event::MemorySink;
    use pkg_types::pod::{PodPhase, PodTemplate};
    use pkg_types::replicaset::{ReplicaSet, ReplicaSetSpec};
    use pkg_types::selector::Selector;
    use pkg_types::{Kind, Object};
    use std::collections::HashMap;

    fn fast_config() -> ControllerConfig {
        ControllerConfig {
            workers: 3,
            resync_interval: Duration::from_millis(200),
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(100),
            max_conflict_retries: 3,
        }
    }

    fn make_rs(name: &str, replicas: u32) -> Object {
        let labels = HashMap::from([("app".to_string(), name.to_string())]);
        Object::ReplicaSet(ReplicaSet {
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
        })
    }

    async fn live_pods(store: &Store, owner: &str) -> usize {
        store
            .list_pods(&Selector::owned_by(owner))
            .await
            .unwrap()
            .iter()
            .filter(|p| p.is_live())
            .count()
    }

    async fn wait_for_live(store: &Store, owner: &str, expected: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            let live = live_pods(store, owner).await;
            if live == expected {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{} has {} live pods, expected {}",
                owner,
                live,
                expected
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn scale(store: &Store, name: &str, replicas: u32) {
        let mut rs = store.get_replicaset(name).await.unwrap();
        rs.spec.replicas = replicas;
        store.put(Object::ReplicaSet(rs)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_converges_through_scale_changes_and_delete() {
        let store = Store::new();
        let mut manager =
            ControllerManager::new(store.clone(), fast_config(), Arc::new(MemorySink::new()));
        manager.start().await.unwrap();

        store.create(make_rs("web", 3)).await.unwrap();
        store.create(make_rs("api", 2)).await.unwrap();
        wait_for_live(&store, "web", 3).await;
        wait_for_live(&store, "api", 2).await;

        scale(&store, "web", 5).await;
        wait_for_live(&store, "web", 5).await;
        scale(&store, "web", 1).await;
        wait_for_live(&store, "web", 1).await;

        store.delete(Kind::ReplicaSet, "web", None).await.unwrap();
        wait_for_live(&store, "web", 0).await;

        // Several resync periods later nothing has come back.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(live_pods(&store, "web").await, 0);
        assert_eq!(live_pods(&store, "api").await, 2);
        assert!(manager.statuses().get("web").is_none());
        assert!(manager.statuses().get("api").unwrap().last_error.is_none());

        manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_externally_deleted_pods_are_replaced() {
        let store = Store::new();
        let mut manager =
            ControllerManager::new(store.clone(), fast_config(), Arc::new(MemorySink::new()));
        store.create(make_rs("web", 2)).await.unwrap();
        manager.start().await.unwrap();
        wait_for_live(&store, "web", 2).await;

        let victim = store.list_pods(&Selector::owned_by("web")).await.unwrap()[0]
            .id
            .clone();
        store.delete(Kind::Pod, &victim, None).await.unwrap();
        wait_for_live(&store, "web", 2).await;
        assert!(store.get_pod(&victim).await.unwrap_err().is_not_found());

        manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rejected_pod_keeps_retrying_with_visible_error() {
        let store = Store::new();
        let mut manager =
            ControllerManager::new(store.clone(), fast_config(), Arc::new(MemorySink::new()));
        manager.start().await.unwrap();
        store.create(make_rs("web", 1)).await.unwrap();
        wait_for_live(&store, "web", 1).await;

        let mut pod = store.list_pods(&Selector::owned_by("web")).await.unwrap().remove(0);
        pod.status_message = Some("no eligible nodes".to_string());
        store.put(Object::Pod(pod)).await.unwrap();

        let queue = manager.queue();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while queue.num_requeues("web") < 3 {
            assert!(tokio::time::Instant::now() < deadline, "key was not retried");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let record = manager.statuses().get("web").unwrap();
        assert!(record.last_error.unwrap().contains("no eligible nodes"));

        // Once the pod is placed the key recovers and the backoff resets.
        let mut pod = store.list_pods(&Selector::owned_by("web")).await.unwrap().remove(0);
        pod.status_message = None;
        pod.node_name = Some("node-1".to_string());
        pod.phase = PodPhase::Running;
        store.put(Object::Pod(pod)).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while queue.num_requeues("web") != 0 {
            assert!(tokio::time::Instant::now() < deadline, "backoff was not reset");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(manager.statuses().get("web").unwrap().last_error.is_none());
        assert_eq!(live_pods(&store, "web").await, 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_fails_on_closed_store() {
        let store = Store::new();
        store.close().await;
        let mut manager = ControllerManager::new(store, fast_config(), Arc::new(MemorySink::new()));
        assert!(manager.start().await.is_err());
        manager.shutdown().await;
    }
}
