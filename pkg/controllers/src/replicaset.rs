use pkg_constants::controller::{DEFAULT_MAX_CONFLICT_RETRIES, POD_ID_SUFFIX_LEN};
use pkg_state::Store;
use pkg_types::event::{EventResult, EventSink, ReconcileAction, ReconcileEvent};
use pkg_types::pod::{Pod, PodPhase};
use pkg_types::replicaset::ReplicaSet;
use pkg_types::selector::Selector;
use pkg_types::{ControlError, Kind, Object, Result};
use std::cmp::Reverse;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What one reconciliation pass decided to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub create: u32,
    /// Live pods to remove, in deletion order.
    pub delete: Vec<Pod>,
    /// Terminating pods to remove. They never count as replicas.
    pub cleanup: Vec<Pod>,
}

impl ReconcilePlan {
    pub fn is_noop(&self) -> bool {
        self.create == 0 && self.delete.is_empty() && self.cleanup.is_empty()
    }
}

/// Result of a successful `reconcile_once`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub created: u32,
    pub deleted: u32,
    /// The ReplicaSet no longer exists and its pods were cleaned up.
    pub owner_gone: bool,
}

/// Lower ranks are deleted first when scaling down.
fn deletion_rank(phase: PodPhase) -> u8 {
    match phase {
        PodPhase::Failed | PodPhase::Succeeded => 0,
        PodPhase::Pending => 1,
        PodPhase::Running => 2,
        PodPhase::Terminating => 3,
    }
}

/// Pure diff between desired replicas and the observed owned pods.
///
/// Terminating pods do not count as live; they always land in `cleanup`.
/// Scale-down victims are ordered by phase (finished, then Pending, then
/// Running), then newest creation first, then id.
pub fn plan_replicas(desired: u32, pods: &[Pod]) -> ReconcilePlan {
    let (mut live, terminating): (Vec<&Pod>, Vec<&Pod>) =
        pods.iter().partition(|p| p.is_live());
    let cleanup: Vec<Pod> = terminating.into_iter().cloned().collect();
    let count = live.len() as u64;
    let desired_count = u64::from(desired);

    if count < desired_count {
        return ReconcilePlan {
            create: desired - count as u32,
            delete: Vec::new(),
            cleanup,
        };
    }
    if count == desired_count {
        return ReconcilePlan {
            cleanup,
            ..Default::default()
        };
    }

    live.sort_by(|a, b| {
        (
            deletion_rank(a.phase),
            Reverse(a.metadata.creation_revision),
            &a.id,
        )
            .cmp(&(
                deletion_rank(b.phase),
                Reverse(b.metadata.creation_revision),
                &b.id,
            ))
    });
    let excess = (count - desired_count) as usize;
    ReconcilePlan {
        create: 0,
        delete: live.into_iter().take(excess).cloned().collect(),
        cleanup,
    }
}

/// Produces the id of a new pod from its owner's name.
type PodNamer = Arc<dyn Fn(&str) -> String + Send + Sync>;

fn random_pod_name(owner: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", owner, &suffix[..POD_ID_SUFFIX_LEN])
}

/// Controller that reconciles ReplicaSets into Pods.
/// Ensures the desired number of pod replicas exist.
pub struct ReplicaSetController {
    store: Store,
    sink: Arc<dyn EventSink>,
    max_conflict_retries: u32,
    pod_name: PodNamer,
}

impl ReplicaSetController {
    pub fn new(store: Store, sink: Arc<dyn EventSink>) -> Self {
        Self {
            store,
            sink,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
            pod_name: Arc::new(random_pod_name),
        }
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    /// Converge the pods owned by `key` onto its ReplicaSet.
    ///
    /// Safe to call any number of times: every pass starts from what the
    /// store holds right now. Conflicts are retried here with a fresh read;
    /// any other failure is returned after every planned action was tried.
    pub async fn reconcile_once(&self, key: &str) -> Result<ReconcileOutcome> {
        let mut attempt = 0;
        loop {
            match self.reconcile_pass(key).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_conflict() && attempt < self.max_conflict_retries => {
                    attempt += 1;
                    debug!("RS {}: conflict ({}), recomputing (attempt {})", key, e, attempt);
                }
                Err(e) => {
                    self.emit(key, ReconcileAction::Error, Err(&e));
                    return Err(e);
                }
            }
        }
    }

    async fn reconcile_pass(&self, key: &str) -> Result<ReconcileOutcome> {
        let rs = match self.store.get_replicaset(key).await {
            Ok(rs) => rs,
            Err(e) if e.is_not_found() => return self.cascade_delete(key).await,
            Err(e) => return Err(e),
        };

        let pods = self.store.list_pods(&Selector::owned_by(key)).await?;
        let plan = plan_replicas(rs.spec.replicas, &pods);
        if plan.is_noop() {
            debug!("RS {}: {} replica(s) in place", key, rs.spec.replicas);
        }

        let mut outcome = ReconcileOutcome::default();
        let mut first_error: Option<ControlError> = None;

        for _ in 0..plan.create {
            match self.create_pod(&rs).await {
                Ok(pod) => {
                    outcome.created += 1;
                    info!("RS {}: created pod {}", rs.name, pod.id);
                }
                Err(e) => {
                    warn!("RS {}: failed to create pod: {}", rs.name, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        for pod in plan.delete.iter().chain(&plan.cleanup) {
            match self.delete_pod(key, pod, Some(pod.metadata.resource_version)).await {
                Ok(true) => {
                    outcome.deleted += 1;
                    info!("RS {}: deleted pod {} ({})", rs.name, pod.id, pod.phase);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("RS {}: failed to delete pod {}: {}", rs.name, pod.id, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        // A pod the scheduler keeps rejecting holds the key in backoff until
        // placement succeeds.
        let rejected = pods
            .iter()
            .filter(|p| p.is_live() && p.is_unschedulable())
            .find(|p| !plan.delete.iter().any(|d| d.id == p.id));
        if let Some(pod) = rejected {
            return Err(ControlError::Scheduling {
                pod: pod.id.clone(),
                reason: pod.status_message.clone().unwrap_or_default(),
            });
        }

        Ok(outcome)
    }

    /// The owner is gone: remove every pod that still points at it,
    /// terminating ones included.
    async fn cascade_delete(&self, key: &str) -> Result<ReconcileOutcome> {
        let pods = self.store.list_pods(&Selector::owned_by(key)).await?;
        let mut outcome = ReconcileOutcome {
            owner_gone: true,
            ..Default::default()
        };
        let mut first_error: Option<ControlError> = None;

        for pod in &pods {
            match self.delete_pod(key, pod, None).await {
                Ok(true) => outcome.deleted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("RS {}: cascade delete of pod {} failed: {}", key, pod.id, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        if outcome.deleted > 0 {
            info!("RS {}: owner gone, removed {} pod(s)", key, outcome.deleted);
        }
        Ok(outcome)
    }

    async fn create_pod(&self, rs: &ReplicaSet) -> Result<Pod> {
        let id = (self.pod_name)(&rs.name);
        let pod = Pod::from_template(id.clone(), &rs.name, &rs.spec.template);

        let result = self
            .store
            .create(Object::Pod(pod))
            .await
            .and_then(|object| {
                object
                    .into_pod()
                    .ok_or_else(|| {
                        ControlError::Corrupted(format!("created pod {} is not a Pod", id))
                    })
            });
        self.emit(
            &rs.name,
            ReconcileAction::CreatePod { pod: id },
            result.as_ref().map(|_| ()),
        );
        result
    }

    /// Returns false when the pod was already gone.
    async fn delete_pod(&self, key: &str, pod: &Pod, precondition: Option<u64>) -> Result<bool> {
        let result = match self.store.delete(Kind::Pod, &pod.id, precondition).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => {
                debug!("RS {}: pod {} already gone", key, pod.id);
                return Ok(false);
            }
            Err(e) => Err(e),
        };
        self.emit(
            key,
            ReconcileAction::DeletePod {
                pod: pod.id.clone(),
            },
            result.as_ref().map(|_| ()),
        );
        result
    }

    fn emit(
        &self,
        key: &str,
        action: ReconcileAction,
        result: std::result::Result<(), &ControlError>,
    ) {
        let result = match result {
            Ok(()) => EventResult::Success,
            Err(e) => EventResult::Failure(e.to_string()),
        };
        self.sink.emit(ReconcileEvent::new(key, action, result));
    }
}
