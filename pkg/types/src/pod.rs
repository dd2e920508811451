use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::object::ObjectMeta;

// --- Pod template ---

/// Descriptor a ReplicaSet stamps onto every pod it creates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodTemplate {
    pub image: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Node labels a candidate node must carry (exact match).
    #[serde(default)]
    pub node_affinity: HashMap<String, String>,
}

// --- Pod phase ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PodPhase {
    Pending,
    Running,
    Failed,
    Succeeded,
    Terminating,
}

impl PodPhase {
    /// Terminating pods are on their way out and do not count as replicas.
    pub fn is_live(self) -> bool {
        self != PodPhase::Terminating
    }
}

impl std::fmt::Display for PodPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PodPhase::Pending => write!(f, "Pending"),
            PodPhase::Running => write!(f, "Running"),
            PodPhase::Failed => write!(f, "Failed"),
            PodPhase::Succeeded => write!(f, "Succeeded"),
            PodPhase::Terminating => write!(f, "Terminating"),
        }
    }
}

// --- Pod ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pod {
    pub id: String,
    /// Name of the owning ReplicaSet. Lookup key only, never a lifetime handle.
    #[serde(default)]
    pub owner_name: Option<String>,
    /// Copied from the template at creation; immutable afterwards.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub image: String,
    #[serde(default)]
    pub node_affinity: HashMap<String, String>,
    pub phase: PodPhase,
    /// The node this pod is bound to (set by the scheduler)
    #[serde(default)]
    pub node_name: Option<String>,
    /// Human-readable reason for the current phase (e.g. scheduler rejection).
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub metadata: ObjectMeta,
}

impl Pod {
    /// Stamp a fresh Pending pod from a template.
    pub fn from_template(id: String, owner: &str, template: &PodTemplate) -> Self {
        Self {
            id,
            owner_name: Some(owner.to_string()),
            labels: template.labels.clone(),
            image: template.image.clone(),
            node_affinity: template.node_affinity.clone(),
            phase: PodPhase::Pending,
            node_name: None,
            status_message: None,
            metadata: ObjectMeta::default(),
        }
    }

    pub fn is_live(&self) -> bool {
        self.phase.is_live()
    }

    /// A pod the scheduler has looked at and could not place.
    pub fn is_unschedulable(&self) -> bool {
        self.node_name.is_none() && self.status_message.is_some()
    }
}
