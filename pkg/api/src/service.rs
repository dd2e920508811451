use pkg_constants::controller::DEFAULT_MAX_CONFLICT_RETRIES;
use pkg_controllers::status::{StatusCache, project_status};
use pkg_state::Store;
use pkg_types::object::ObjectMeta;
use pkg_types::pod::Pod;
use pkg_types::replicaset::{ReplicaSet, ReplicaSetStatus, ReplicaSetUpdate};
use pkg_types::selector::Selector;
use pkg_types::validate::{validate_name, validate_replicaset, validate_spec};
use pkg_types::{ControlError, Kind, Object, Result};
use tracing::{debug, info};

/// Inbound operations on ReplicaSets. Every write is validated here before
/// it reaches the store.
#[derive(Clone)]
pub struct ReplicaSetService {
    store: Store,
    statuses: StatusCache,
    max_conflict_retries: u32,
}

impl ReplicaSetService {
    pub fn new(store: Store, statuses: StatusCache) -> Self {
        Self {
            store,
            statuses,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        }
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub async fn create_replicaset(&self, mut rs: ReplicaSet) -> Result<ReplicaSet> {
        validate_replicaset(&rs)?;
        rs.metadata = ObjectMeta::default();
        let created = self.store.create(Object::ReplicaSet(rs)).await?;
        info!(
            "Created replicaset {} (rv={})",
            created.name(),
            created.resource_version()
        );
        into_replicaset(created)
    }

    /// Read-modify-write with local conflict retries.
    pub async fn update_replicaset(
        &self,
        name: &str,
        update: ReplicaSetUpdate,
    ) -> Result<ReplicaSet> {
        validate_name(name)?;
        let mut attempt = 0;
        loop {
            let mut rs = self.store.get_replicaset(name).await?;
            if !update.apply_to(&mut rs.spec) {
                return Ok(rs);
            }
            validate_spec(&rs.spec)?;
            match self.store.put(Object::ReplicaSet(rs)).await {
                Ok(updated) => {
                    info!(
                        "Updated replicaset {} (rv={})",
                        name,
                        updated.resource_version()
                    );
                    return into_replicaset(updated);
                }
                Err(e) if e.is_conflict() && attempt < self.max_conflict_retries => {
                    attempt += 1;
                    debug!("Conflict updating replicaset {}, retry {}", name, attempt);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Delete the ReplicaSet; its pods are removed by the controller.
    pub async fn delete_replicaset(&self, name: &str) -> Result<ReplicaSet> {
        validate_name(name)?;
        let deleted = self.store.delete(Kind::ReplicaSet, name, None).await?;
        info!("Deleted replicaset {}", name);
        into_replicaset(deleted)
    }

    pub async fn get_replicaset(&self, name: &str) -> Result<ReplicaSet> {
        self.store.get_replicaset(name).await
    }

    pub async fn replicaset_status(&self, name: &str) -> Result<ReplicaSetStatus> {
        project_status(&self.store, &self.statuses, name).await
    }

    pub async fn list_replicasets(&self) -> Result<Vec<ReplicaSet>> {
        self.store.list_replicasets(&Selector::everything()).await
    }

    pub async fn list_pods(&self, owner: Option<&str>) -> Result<Vec<Pod>> {
        let selector = match owner {
            Some(owner) => Selector::owned_by(owner),
            None => Selector::everything(),
        };
        self.store.list_pods(&selector).await
    }
}

fn into_replicaset(object: Object) -> Result<ReplicaSet> {
    let name = object.name().to_string();
    object.into_replicaset().ok_or_else(|| {
        ControlError::Corrupted(format!("replicaset '{}' stored as another kind", name))
    })
}
