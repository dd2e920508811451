use chrono::Utc;
use pkg_constants::state::UNCONDITIONAL_VERSION;
use pkg_types::pod::Pod;
use pkg_types::replicaset::ReplicaSet;
use pkg_types::selector::Selector;
use pkg_types::{ControlError, Kind, Object, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};

use crate::watch::{EventType, WatchEvent, Watcher, WatcherEntry};

/// In-memory, versioned object store for ReplicaSets and Pods.
///
/// Cheap to clone; every clone shares the same state. Writes are serialized
/// by one store-wide lock and each successful write is delivered to the
/// matching watchers before the call returns.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<RwLock<StoreInner>>,
}

#[derive(Default)]
struct StoreInner {
    revision: u64,
    replicasets: Table,
    pods: Table,
    /// owner name -> creation revision -> pod id
    owners: HashMap<String, BTreeMap<u64, String>>,
    watchers: Vec<WatcherEntry>,
    next_watcher_id: u64,
    closed: bool,
}

#[derive(Default)]
struct Table {
    objects: HashMap<String, Object>,
    /// creation revision -> id, i.e. insertion order
    order: BTreeMap<u64, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Create,
    Upsert,
}

impl Store {
    pub fn new() -> Self {
        info!("Opening in-memory state store");
        Self::default()
    }

    /// Insert a new object; fails with `AlreadyExists` if the id is taken.
    pub async fn create(&self, object: Object) -> Result<Object> {
        let mut inner = self.inner.write().await;
        inner.ensure_open()?;
        inner.write(object, WriteMode::Create)
    }

    /// Insert or replace an object by id.
    ///
    /// A non-zero `resource_version` on the supplied object is a precondition:
    /// it must equal the stored version (`Conflict` otherwise) and the object
    /// must exist (`NotFound` otherwise). Zero writes unconditionally.
    pub async fn put(&self, object: Object) -> Result<Object> {
        let mut inner = self.inner.write().await;
        inner.ensure_open()?;
        inner.write(object, WriteMode::Upsert)
    }

    pub async fn get(&self, kind: Kind, name: &str) -> Result<Object> {
        let inner = self.inner.read().await;
        inner.ensure_open()?;
        inner
            .table(kind)
            .objects
            .get(name)
            .cloned()
            .ok_or_else(|| ControlError::not_found(kind, name))
    }

    pub async fn get_replicaset(&self, name: &str) -> Result<ReplicaSet> {
        let object = self.get(Kind::ReplicaSet, name).await?;
        object
            .into_replicaset()
            .ok_or_else(|| ControlError::Corrupted(format!("'{}' is not a ReplicaSet", name)))
    }

    pub async fn get_pod(&self, id: &str) -> Result<Pod> {
        let object = self.get(Kind::Pod, id).await?;
        object
            .into_pod()
            .ok_or_else(|| ControlError::Corrupted(format!("'{}' is not a Pod", id)))
    }

    /// All objects of `kind` matching `selector`, in insertion order.
    pub async fn list(&self, kind: Kind, selector: &Selector) -> Result<Vec<Object>> {
        let inner = self.inner.read().await;
        inner.ensure_open()?;
        inner.list(kind, selector)
    }

    pub async fn list_pods(&self, selector: &Selector) -> Result<Vec<Pod>> {
        Ok(self
            .list(Kind::Pod, selector)
            .await?
            .into_iter()
            .filter_map(Object::into_pod)
            .collect())
    }

    pub async fn list_replicasets(&self, selector: &Selector) -> Result<Vec<ReplicaSet>> {
        Ok(self
            .list(Kind::ReplicaSet, selector)
            .await?
            .into_iter()
            .filter_map(Object::into_replicaset)
            .collect())
    }

    /// Remove an object, optionally only if it is still at `precondition`.
    pub async fn delete(
        &self,
        kind: Kind,
        name: &str,
        precondition: Option<u64>,
    ) -> Result<Object> {
        let mut inner = self.inner.write().await;
        inner.ensure_open()?;
        inner.remove(kind, name, precondition)
    }

    /// Subscribe to future changes of one kind. No history is replayed.
    pub async fn watch(&self, kind: Kind) -> Result<Watcher> {
        let mut inner = self.inner.write().await;
        inner.ensure_open()?;
        Ok(inner.register(kind))
    }

    /// Snapshot plus subscription taken under the same write lock, so every
    /// write is either in the snapshot or delivered to the watcher.
    pub async fn list_and_watch(
        &self,
        kind: Kind,
        selector: &Selector,
    ) -> Result<(Vec<Object>, Watcher)> {
        let mut inner = self.inner.write().await;
        inner.ensure_open()?;
        let snapshot = inner.list(kind, selector)?;
        let watcher = inner.register(kind);
        Ok((snapshot, watcher))
    }

    /// Latest store-wide revision.
    pub async fn revision(&self) -> u64 {
        self.inner.read().await.revision
    }

    /// Drop every subscription, ending all watch streams. The store keeps
    /// serving reads and writes; subscribers are expected to relist.
    pub async fn disconnect_watchers(&self) {
        let mut inner = self.inner.write().await;
        let dropped = inner.watchers.len();
        inner.watchers.clear();
        info!("Disconnected {} watcher(s)", dropped);
    }

    /// Close the store. Watch streams end and every later call fails with
    /// `Closed`.
    pub async fn close(&self) {
        let mut inner = self.inner.write().await;
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.watchers.clear();
        info!("Closing state store at revision {}", inner.revision);
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.read().await.closed
    }
}

impl StoreInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(ControlError::Closed("state store"));
        }
        Ok(())
    }

    fn table(&self, kind: Kind) -> &Table {
        match kind {
            Kind::ReplicaSet => &self.replicasets,
            Kind::Pod => &self.pods,
        }
    }

    fn table_mut(&mut self, kind: Kind) -> &mut Table {
        match kind {
            Kind::ReplicaSet => &mut self.replicasets,
            Kind::Pod => &mut self.pods,
        }
    }

    fn list(&self, kind: Kind, selector: &Selector) -> Result<Vec<Object>> {
        let table = self.table(kind);

        // Owner lookups go through the index instead of a full scan.
        if kind == Kind::Pod
            && let Some(owner) = &selector.owner
        {
            let Some(ids) = self.owners.get(owner) else {
                return Ok(Vec::new());
            };
            let mut out = Vec::with_capacity(ids.len());
            for id in ids.values() {
                let object = table.objects.get(id).ok_or_else(|| {
                    ControlError::Corrupted(format!(
                        "owner index for '{}' references missing pod '{}'",
                        owner, id
                    ))
                })?;
                if selector.matches(object) {
                    out.push(object.clone());
                }
            }
            return Ok(out);
        }

        Ok(table
            .order
            .values()
            .filter_map(|id| table.objects.get(id))
            .filter(|object| selector.matches(object))
            .cloned()
            .collect())
    }

    fn write(&mut self, mut object: Object, mode: WriteMode) -> Result<Object> {
        let kind = object.kind();
        let name = object.name().to_string();
        let expected = object.resource_version();

        let event_type = match self.table(kind).objects.get(&name) {
            Some(current) => {
                if mode == WriteMode::Create {
                    return Err(ControlError::AlreadyExists { kind, name });
                }
                let actual = current.resource_version();
                if expected != UNCONDITIONAL_VERSION && expected != actual {
                    return Err(ControlError::Conflict {
                        kind,
                        name,
                        expected,
                        actual,
                    });
                }
                check_immutable(current, &object)?;
                let meta = object.meta_mut();
                meta.creation_revision = current.meta().creation_revision;
                meta.created_at = current.meta().created_at;
                EventType::Modified
            }
            None => {
                if expected != UNCONDITIONAL_VERSION {
                    return Err(ControlError::not_found(kind, name));
                }
                EventType::Added
            }
        };

        self.revision += 1;
        let revision = self.revision;
        let meta = object.meta_mut();
        meta.resource_version = revision;
        if event_type == EventType::Added {
            meta.creation_revision = revision;
            meta.created_at = Utc::now();
            if let Some(owner) = object.owner_name() {
                self.owners
                    .entry(owner.to_string())
                    .or_default()
                    .insert(revision, name.clone());
            }
            self.table_mut(kind).order.insert(revision, name.clone());
        }
        self.table_mut(kind)
            .objects
            .insert(name.clone(), object.clone());

        debug!("{:?} {} {} at revision {}", event_type, kind, name, revision);
        self.emit(WatchEvent {
            revision,
            event_type,
            object: object.clone(),
        });
        Ok(object)
    }

    fn remove(&mut self, kind: Kind, name: &str, precondition: Option<u64>) -> Result<Object> {
        let current = self
            .table(kind)
            .objects
            .get(name)
            .ok_or_else(|| ControlError::not_found(kind, name))?;
        if let Some(expected) = precondition
            && expected != current.resource_version()
        {
            return Err(ControlError::Conflict {
                kind,
                name: name.to_string(),
                expected,
                actual: current.resource_version(),
            });
        }

        let table = self.table_mut(kind);
        let Some(mut object) = table.objects.remove(name) else {
            return Err(ControlError::not_found(kind, name));
        };
        let created = object.meta().creation_revision;
        table.order.remove(&created);
        if let Some(owner) = object.owner_name()
            && let Some(ids) = self.owners.get_mut(owner)
        {
            ids.remove(&created);
            if ids.is_empty() {
                self.owners.remove(owner);
            }
        }

        self.revision += 1;
        let revision = self.revision;
        object.meta_mut().resource_version = revision;

        debug!("Deleted {} {} at revision {}", kind, name, revision);
        self.emit(WatchEvent {
            revision,
            event_type: EventType::Deleted,
            object: object.clone(),
        });
        Ok(object)
    }

    fn register(&mut self, kind: Kind) -> Watcher {
        let (tx, rx) = mpsc::unbounded_channel();
        self.next_watcher_id += 1;
        let id = self.next_watcher_id;
        self.watchers.push(WatcherEntry { kind, tx });
        debug!("Watcher {} registered for {} at revision {}", id, kind, self.revision);
        Watcher::new(id, kind, rx)
    }

    /// Deliver to every live watcher of the event's kind; receivers that
    /// were dropped are pruned here.
    fn emit(&mut self, event: WatchEvent) {
        let kind = event.kind();
        self.watchers
            .retain(|w| w.kind != kind || w.tx.send(event.clone()).is_ok());
    }
}

/// Pod labels and owner, and a ReplicaSet's selector, never change after
/// creation.
fn check_immutable(current: &Object, next: &Object) -> Result<()> {
    match (current, next) {
        (Object::Pod(old), Object::Pod(new)) => {
            if old.labels != new.labels {
                return Err(ControlError::Validation(format!(
                    "labels of pod '{}' are immutable",
                    old.id
                )));
            }
            if old.owner_name != new.owner_name {
                return Err(ControlError::Validation(format!(
                    "owner of pod '{}' is immutable",
                    old.id
                )));
            }
        }
        (Object::ReplicaSet(old), Object::ReplicaSet(new)) => {
            if old.spec.selector != new.spec.selector {
                return Err(ControlError::Validation(format!(
                    "selector of replicaset '{}' is immutable",
                    old.name
                )));
            }
        }
        _ => {}
    }
    Ok(())
}
