use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::pod::Pod;
use crate::replicaset::ReplicaSet;

/// The two resource kinds the store knows about.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Kind {
    ReplicaSet,
    Pod,
}

impl Kind {
    pub const ALL: [Kind; 2] = [Kind::ReplicaSet, Kind::Pod];
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Kind::ReplicaSet => write!(f, "ReplicaSet"),
            Kind::Pod => write!(f, "Pod"),
        }
    }
}

impl std::str::FromStr for Kind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "replicaset" | "replicasets" | "rs" => Ok(Kind::ReplicaSet),
            "pod" | "pods" => Ok(Kind::Pod),
            other => Err(format!("unknown kind '{}'", other)),
        }
    }
}

/// Store-managed bookkeeping shared by every object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Bumped on every write; 0 means "never stored" / "no precondition".
    #[serde(default)]
    pub resource_version: u64,
    /// Store revision at which the object was first inserted.
    #[serde(default)]
    pub creation_revision: u64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Default for ObjectMeta {
    fn default() -> Self {
        Self {
            resource_version: 0,
            creation_revision: 0,
            created_at: Utc::now(),
        }
    }
}

/// Tagged union over the stored kinds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "object")]
pub enum Object {
    ReplicaSet(ReplicaSet),
    Pod(Pod),
}

impl Object {
    pub fn kind(&self) -> Kind {
        match self {
            Object::ReplicaSet(_) => Kind::ReplicaSet,
            Object::Pod(_) => Kind::Pod,
        }
    }

    /// The object's unique id within its kind.
    pub fn name(&self) -> &str {
        match self {
            Object::ReplicaSet(rs) => &rs.name,
            Object::Pod(pod) => &pod.id,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Object::ReplicaSet(rs) => &rs.metadata,
            Object::Pod(pod) => &pod.metadata,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Object::ReplicaSet(rs) => &mut rs.metadata,
            Object::Pod(pod) => &mut pod.metadata,
        }
    }

    pub fn resource_version(&self) -> u64 {
        self.meta().resource_version
    }

    /// Labels used for selector matching. ReplicaSets are matched on their
    /// template labels.
    pub fn labels(&self) -> &HashMap<String, String> {
        match self {
            Object::ReplicaSet(rs) => &rs.spec.template.labels,
            Object::Pod(pod) => &pod.labels,
        }
    }

    pub fn owner_name(&self) -> Option<&str> {
        match self {
            Object::ReplicaSet(_) => None,
            Object::Pod(pod) => pod.owner_name.as_deref(),
        }
    }

    pub fn into_pod(self) -> Option<Pod> {
        match self {
            Object::Pod(pod) => Some(pod),
            Object::ReplicaSet(_) => None,
        }
    }

    pub fn into_replicaset(self) -> Option<ReplicaSet> {
        match self {
            Object::ReplicaSet(rs) => Some(rs),
            Object::Pod(_) => None,
        }
    }
}

impl From<Pod> for Object {
    fn from(pod: Pod) -> Self {
        Object::Pod(pod)
    }
}

impl From<ReplicaSet> for Object {
    fn from(rs: ReplicaSet) -> Self {
        Object::ReplicaSet(rs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_plural_and_short_forms() {
        assert_eq!("pods".parse::<Kind>(), Ok(Kind::Pod));
        assert_eq!("ReplicaSet".parse::<Kind>(), Ok(Kind::ReplicaSet));
        assert_eq!("rs".parse::<Kind>(), Ok(Kind::ReplicaSet));
        assert!("deployment".parse::<Kind>().is_err());
    }

    #[test]
    fn partial_metadata_fills_defaults() {
        let meta: ObjectMeta = serde_yaml::from_str("resource_version: 5").unwrap();
        assert_eq!(meta.resource_version, 5);
        assert_eq!(meta.creation_revision, 0);

        let meta: ObjectMeta = serde_yaml::from_str("{}").unwrap();
        assert_eq!(meta.resource_version, 0);
    }
}
