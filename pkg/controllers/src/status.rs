use chrono::{DateTime, Utc};
use pkg_state::Store;
use pkg_types::pod::PodPhase;
use pkg_types::replicaset::ReplicaSetStatus;
use pkg_types::selector::Selector;
use pkg_types::{ControlError, Result};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Outcome of the latest reconciliation of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileRecord {
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub reconciled_at: DateTime<Utc>,
}

/// Controller-side memory of reconcile results. Not persisted; the store
/// stays the only source of truth for desired and observed state.
#[derive(Debug, Clone, Default)]
pub struct StatusCache {
    records: Arc<RwLock<HashMap<String, ReconcileRecord>>>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, key: &str) {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records.insert(
            key.to_string(),
            ReconcileRecord {
                last_error: None,
                consecutive_failures: 0,
                reconciled_at: Utc::now(),
            },
        );
    }

    pub fn record_failure(&self, key: &str, error: &ControlError) {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let failures = records
            .get(key)
            .map(|r| r.consecutive_failures)
            .unwrap_or(0);
        records.insert(
            key.to_string(),
            ReconcileRecord {
                last_error: Some(error.to_string()),
                consecutive_failures: failures.saturating_add(1),
                reconciled_at: Utc::now(),
            },
        );
    }

    pub fn remove(&self, key: &str) {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records.remove(key);
    }

    pub fn get(&self, key: &str) -> Option<ReconcileRecord> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records.get(key).cloned()
    }
}

/// Compute the status of `name` from the store plus the last reconcile
/// result. Nothing here is persisted.
pub async fn project_status(
    store: &Store,
    statuses: &StatusCache,
    name: &str,
) -> Result<ReplicaSetStatus> {
    let rs = store.get_replicaset(name).await?;
    let pods = store.list_pods(&Selector::owned_by(name)).await?;

    let mut status = ReplicaSetStatus {
        name: rs.name.clone(),
        desired: rs.spec.replicas,
        resource_version: rs.metadata.resource_version,
        ..Default::default()
    };
    for pod in &pods {
        match pod.phase {
            PodPhase::Terminating => status.terminating += 1,
            PodPhase::Pending => status.pending += 1,
            PodPhase::Running => status.running += 1,
            PodPhase::Failed | PodPhase::Succeeded => {}
        }
        if pod.is_live() {
            status.live += 1;
        }
    }
    if let Some(record) = statuses.get(name) {
        status.last_error = record.last_error;
        status.last_reconciled_at = Some(record.reconciled_at);
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::Object;
    use pkg_types::pod::{Pod, PodTemplate};
    use pkg_types::replicaset::{ReplicaSet, ReplicaSetSpec};

    #[test]
    fn test_failures_accumulate_until_success() {
        let cache = StatusCache::new();
        let err = ControlError::Validation("boom".to_string());
        cache.record_failure("web", &err);
        cache.record_failure("web", &err);
        let record = cache.get("web").unwrap();
        assert_eq!(record.consecutive_failures, 2);
        assert_eq!(record.last_error.as_deref(), Some("validation failed: boom"));

        cache.record_success("web");
        let record = cache.get("web").unwrap();
        assert_eq!(record.consecutive_failures, 0);
        assert!(record.last_error.is_none());

        cache.remove("web");
        assert!(cache.get("web").is_none());
    }

    #[tokio::test]
    async fn test_projection_counts_phases() {
        let store = Store::new();
        let template = PodTemplate {
            image: "nginx:1.27".to_string(),
            labels: HashMap::from([("app".to_string(), "web".to_string())]),
            node_affinity: HashMap::new(),
        };
        store
            .create(Object::ReplicaSet(ReplicaSet {
                name: "web".to_string(),
                spec: ReplicaSetSpec {
                    replicas: 3,
                    selector: HashMap::from([("app".to_string(), "web".to_string())]),
                    template: template.clone(),
                },
                metadata: Default::default(),
            }))
            .await
            .unwrap();
        for (id, phase) in [
            ("web-1", PodPhase::Pending),
            ("web-2", PodPhase::Running),
            ("web-3", PodPhase::Terminating),
        ] {
            let mut pod = Pod::from_template(id.to_string(), "web", &template);
            pod.phase = phase;
            store.create(Object::Pod(pod)).await.unwrap();
        }

        let cache = StatusCache::new();
        cache.record_failure("web", &ControlError::Closed("work queue"));
        let status = project_status(&store, &cache, "web").await.unwrap();
        assert_eq!(status.desired, 3);
        assert_eq!(status.live, 2);
        assert_eq!(status.pending, 1);
        assert_eq!(status.running, 1);
        assert_eq!(status.terminating, 1);
        assert_eq!(status.last_error.as_deref(), Some("work queue is closed"));

        assert!(
            project_status(&store, &cache, "missing")
                .await
                .unwrap_err()
                .is_not_found()
        );
    }
}
