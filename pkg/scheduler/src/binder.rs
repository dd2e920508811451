use pkg_constants::controller::RELIST_RETRY_DELAY_MS;
use pkg_state::{EventType, Store, WatchEvent, Watcher};
use pkg_types::pod::{Pod, PodPhase};
use pkg_types::selector::Selector;
use pkg_types::{ControlError, Kind, Object, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, interval_at};
use tracing::{debug, info, warn};

use crate::NodeAssigner;

/// Binds unassigned pods to nodes through ordinary store writes.
///
/// A successful assignment sets `node_name` and moves the pod to `Running`;
/// a rejection is written to `status_message` and the pod stays `Pending`
/// until a later attempt succeeds. Rejected pods are retried every
/// `retry_interval`.
pub struct SchedulingLoop {
    store: Store,
    assigner: Arc<dyn NodeAssigner>,
    retry_interval: Duration,
    /// Unbound pods by id, as last seen in the store.
    unbound: HashMap<String, Pod>,
}

impl SchedulingLoop {
    pub fn new(store: Store, assigner: Arc<dyn NodeAssigner>, retry_interval: Duration) -> Self {
        Self {
            store,
            assigner,
            retry_interval,
            unbound: HashMap::new(),
        }
    }

    /// Run until `shutdown` flips to true or the store closes.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut pod_watch = match self.sync().await {
            Ok(watcher) => watcher,
            Err(e) => {
                warn!("Scheduler could not start: {}", e);
                return;
            }
        };
        info!(
            "Scheduler started (retry={}s, unbound={})",
            self.retry_interval.as_secs(),
            self.unbound.len()
        );

        let mut retry_tick = interval_at(Instant::now() + self.retry_interval, self.retry_interval);
        loop {
            if *shutdown.borrow() {
                break;
            }
            let step = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    Ok(())
                }
                event = pod_watch.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => match self.relist(&mut shutdown).await {
                        Some(watcher) => {
                            pod_watch = watcher;
                            Ok(())
                        }
                        None => break,
                    },
                },
                _ = retry_tick.tick() => self.retry_unbound().await,
            };
            if let Err(ControlError::Closed(what)) = step {
                info!("{} closed, scheduler exiting", what);
                break;
            }
        }
        info!("Scheduler stopped");
    }

    async fn handle(&mut self, event: WatchEvent) -> Result<()> {
        let Object::Pod(pod) = event.object else {
            return Ok(());
        };
        if event.event_type == EventType::Deleted || !needs_node(&pod) {
            self.unbound.remove(&pod.id);
            return Ok(());
        }
        let fresh = pod.status_message.is_none();
        self.unbound.insert(pod.id.clone(), pod.clone());
        // Previously rejected pods wait for the retry tick.
        if fresh {
            self.schedule(pod).await?;
        }
        Ok(())
    }

    async fn retry_unbound(&mut self) -> Result<()> {
        if self.unbound.is_empty() {
            return Ok(());
        }
        debug!("Retrying {} unbound pod(s)", self.unbound.len());
        let pods: Vec<Pod> = self.unbound.values().cloned().collect();
        for pod in pods {
            self.schedule(pod).await?;
        }
        Ok(())
    }

    async fn schedule(&mut self, mut pod: Pod) -> Result<()> {
        let id = pod.id.clone();
        match self.assigner.assign_node(&pod) {
            Ok(node) => {
                pod.node_name = Some(node);
                pod.phase = PodPhase::Running;
                pod.status_message = None;
            }
            Err(ControlError::Scheduling { reason, .. }) => {
                if pod.status_message.as_deref() == Some(reason.as_str()) {
                    return Ok(());
                }
                warn!("Pod {} unschedulable: {}", id, reason);
                pod.status_message = Some(reason);
            }
            Err(e) => return Err(e),
        }

        match self.store.put(Object::Pod(pod)).await {
            Ok(_) => Ok(()),
            // The watch will deliver the newer version.
            Err(ControlError::Conflict { .. }) => {
                debug!("Pod {} changed while scheduling", id);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                self.unbound.remove(&id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn sync(&mut self) -> Result<Watcher> {
        let (pods, watcher) = self
            .store
            .list_and_watch(Kind::Pod, &Selector::everything())
            .await?;
        self.unbound = pods
            .into_iter()
            .filter_map(Object::into_pod)
            .filter(needs_node)
            .map(|pod| (pod.id.clone(), pod))
            .collect();
        self.retry_unbound().await?;
        Ok(watcher)
    }

    async fn relist(&mut self, shutdown: &mut watch::Receiver<bool>) -> Option<Watcher> {
        warn!("Pod watch closed, scheduler relisting");
        loop {
            if *shutdown.borrow() {
                return None;
            }
            match self.sync().await {
                Ok(watcher) => return Some(watcher),
                Err(ControlError::Closed(what)) => {
                    info!("{} closed, scheduler exiting", what);
                    return None;
                }
                Err(e) => {
                    warn!("Scheduler relist failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(RELIST_RETRY_DELAY_MS)).await;
                }
            }
        }
    }
}

fn needs_node(pod: &Pod) -> bool {
    pod.node_name.is_none() && pod.phase == PodPhase::Pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RoundRobinScheduler;
    use pkg_types::node::Node;
    use pkg_types::pod::PodTemplate;

    fn make_pod(id: &str, disk: Option<&str>) -> Object {
        let mut template = PodTemplate {
            image: "nginx:latest".to_string(),
            labels: HashMap::from([("app".to_string(), "web".to_string())]),
            node_affinity: HashMap::new(),
        };
        if let Some(disk) = disk {
            template
                .node_affinity
                .insert("disk".to_string(), disk.to_string());
        }
        Object::Pod(Pod::from_template(id.to_string(), "web", &template))
    }

    async fn wait_for<F>(store: &Store, id: &str, check: F) -> Pod
    where
        F: Fn(&Pod) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            let pod = store.get_pod(id).await.unwrap();
            if check(&pod) {
                return pod;
            }
            assert!(Instant::now() < deadline, "pod {} never reached state: {:?}", id, pod);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_binds_existing_and_new_pods() {
        let store = Store::new();
        store.create(make_pod("web-a", None)).await.unwrap();

        let assigner = Arc::new(RoundRobinScheduler::new(vec![Node::new("node-1")]));
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(
            SchedulingLoop::new(store.clone(), assigner, Duration::from_secs(5)).run(stop_rx),
        );

        let pod = wait_for(&store, "web-a", |p| p.node_name.is_some()).await;
        assert_eq!(pod.node_name.as_deref(), Some("node-1"));
        assert_eq!(pod.phase, PodPhase::Running);

        store.create(make_pod("web-b", None)).await.unwrap();
        wait_for(&store, "web-b", |p| p.phase == PodPhase::Running).await;

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejection_recorded_then_retried() {
        let store = Store::new();
        let assigner = Arc::new(RoundRobinScheduler::new(vec![
            Node::new("node-1").with_label("disk", "hdd"),
        ]));
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(
            SchedulingLoop::new(store.clone(), assigner.clone(), Duration::from_millis(50))
                .run(stop_rx),
        );

        store.create(make_pod("web-a", Some("ssd"))).await.unwrap();
        let pod = wait_for(&store, "web-a", |p| p.status_message.is_some()).await;
        assert!(pod.is_unschedulable());
        assert_eq!(pod.phase, PodPhase::Pending);

        // Repeated rejections with the same reason do not rewrite the pod.
        let version = pod.metadata.resource_version;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            store.get_pod("web-a").await.unwrap().metadata.resource_version,
            version
        );

        assigner.set_nodes(vec![Node::new("node-2").with_label("disk", "ssd")]);
        let pod = wait_for(&store, "web-a", |p| p.node_name.is_some()).await;
        assert_eq!(pod.node_name.as_deref(), Some("node-2"));
        assert!(pod.status_message.is_none());

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_exits_when_store_closes() {
        let store = Store::new();
        let assigner = Arc::new(RoundRobinScheduler::new(vec![]));
        let (_stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(
            SchedulingLoop::new(store.clone(), assigner, Duration::from_millis(50)).run(stop_rx),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.close().await;
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("scheduler did not exit")
            .unwrap();
    }
}
