use pkg_constants::controller::RELIST_RETRY_DELAY_MS;
use pkg_state::{EventType, Store, WatchEvent, Watcher};
use pkg_types::selector::Selector;
use pkg_types::{ControlError, Kind, Object, Result};
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::{debug, info, warn};

use crate::workqueue::WorkQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

/// Turns store watch events into ReplicaSet keys on the work queue.
///
/// Pod events enqueue the pod's owner, ReplicaSet events enqueue the
/// ReplicaSet itself, and every resync interval all known ReplicaSets are
/// enqueued again. A watch stream that ends triggers a full relist.
pub struct Informer {
    store: Store,
    queue: WorkQueue,
    lifecycle: Mutex<Lifecycle>,
    stop_tx: watch::Sender<bool>,
}

impl Informer {
    pub fn new(store: Store, queue: WorkQueue) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            store,
            queue,
            lifecycle: Mutex::new(Lifecycle::Idle),
            stop_tx,
        }
    }

    /// List both kinds, enqueue everything, then follow the watch streams in
    /// a background task.
    ///
    /// Fails with `Closed` after `stop`, and `AlreadyRunning` if started twice.
    pub async fn start(&self, resync_interval: Duration) -> Result<JoinHandle<()>> {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
            match *lifecycle {
                Lifecycle::Idle => *lifecycle = Lifecycle::Running,
                Lifecycle::Running => return Err(ControlError::AlreadyRunning("informer")),
                Lifecycle::Stopped => return Err(ControlError::Closed("informer")),
            }
        }

        let mut run = InformerLoop {
            store: self.store.clone(),
            queue: self.queue.clone(),
            stop_rx: self.stop_tx.subscribe(),
            known: HashSet::new(),
        };
        let (rs_watch, pod_watch) = match run.sync().await {
            Ok(watchers) => watchers,
            Err(e) => {
                *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner) = Lifecycle::Idle;
                return Err(e);
            }
        };

        info!(
            "Informer started (resync={}s, replicasets={})",
            resync_interval.as_secs(),
            run.known.len()
        );
        Ok(tokio::spawn(run.run(rs_watch, pod_watch, resync_interval)))
    }

    /// Cancel the subscription. Calling it again is harmless.
    pub fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if *lifecycle != Lifecycle::Stopped {
            *lifecycle = Lifecycle::Stopped;
            self.stop_tx.send_replace(true);
            debug!("Informer stop requested");
        }
    }

    pub fn is_running(&self) -> bool {
        *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner) == Lifecycle::Running
    }
}

struct InformerLoop {
    store: Store,
    queue: WorkQueue,
    stop_rx: watch::Receiver<bool>,
    /// ReplicaSet names seen so far, used for resync.
    known: HashSet<String>,
}

impl InformerLoop {
    async fn run(mut self, mut rs_watch: Watcher, mut pod_watch: Watcher, resync: Duration) {
        let mut resync_tick = interval_at(Instant::now() + resync, resync);
        loop {
            if *self.stop_rx.borrow() {
                break;
            }
            tokio::select! {
                changed = self.stop_rx.changed() => {
                    if changed.is_err() || *self.stop_rx.borrow() {
                        break;
                    }
                }
                event = rs_watch.recv() => match event {
                    Some(event) => self.handle(event),
                    None => match self.relist().await {
                        Some((rs, pods)) => {
                            rs_watch = rs;
                            pod_watch = pods;
                        }
                        None => break,
                    },
                },
                event = pod_watch.recv() => match event {
                    Some(event) => self.handle(event),
                    None => match self.relist().await {
                        Some((rs, pods)) => {
                            rs_watch = rs;
                            pod_watch = pods;
                        }
                        None => break,
                    },
                },
                _ = resync_tick.tick() => self.resync(),
            }
        }
        info!("Informer stopped");
    }

    fn handle(&mut self, event: WatchEvent) {
        match &event.object {
            Object::ReplicaSet(rs) => {
                if event.event_type == EventType::Deleted {
                    self.known.remove(&rs.name);
                } else {
                    self.known.insert(rs.name.clone());
                }
                debug!("{:?} replicaset {}", event.event_type, rs.name);
                self.queue.add(&rs.name);
            }
            Object::Pod(pod) => {
                if let Some(owner) = &pod.owner_name {
                    debug!("{:?} pod {} (owner {})", event.event_type, pod.id, owner);
                    self.queue.add(owner);
                }
            }
        }
    }

    fn resync(&self) {
        debug!("Resync: enqueueing {} replicaset(s)", self.known.len());
        for name in &self.known {
            self.queue.add(name);
        }
    }

    /// List-then-watch both kinds and treat every listed object as changed.
    async fn sync(&mut self) -> Result<(Watcher, Watcher)> {
        let everything = Selector::everything();
        let (replicasets, rs_watch) = self
            .store
            .list_and_watch(Kind::ReplicaSet, &everything)
            .await?;
        let (pods, pod_watch) = self.store.list_and_watch(Kind::Pod, &everything).await?;

        self.known = replicasets
            .iter()
            .map(|object| object.name().to_string())
            .collect();
        for name in &self.known {
            self.queue.add(name);
        }
        // Owners that no longer exist still get a pass so orphans are cleaned up.
        for owner in pods.iter().filter_map(Object::owner_name) {
            self.queue.add(owner);
        }
        Ok((rs_watch, pod_watch))
    }

    async fn relist(&mut self) -> Option<(Watcher, Watcher)> {
        warn!("Watch stream closed, relisting");
        loop {
            if *self.stop_rx.borrow() {
                return None;
            }
            match self.sync().await {
                Ok(watchers) => {
                    info!("Relist complete ({} replicasets)", self.known.len());
                    return Some(watchers);
                }
                Err(ControlError::Closed(what)) => {
                    info!("{} closed, informer exiting", what);
                    return None;
                }
                Err(e) => {
                    warn!("Relist failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(RELIST_RETRY_DELAY_MS)).await;
                }
            }
        }
    }
}
