use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::object::ObjectMeta;
use crate::pod::PodTemplate;

// --- ReplicaSet spec ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicaSetSpec {
    pub replicas: u32,
    /// Exact-match selector; every pair must appear in `template.labels`.
    #[serde(default)]
    pub selector: HashMap<String, String>,
    pub template: PodTemplate,
}

// --- ReplicaSet ---

/// Desired state: keep `spec.replicas` pods stamped from `spec.template`.
///
/// Example manifest (YAML):
/// ```yaml
/// name: web
/// spec:
///   replicas: 3
///   selector: { app: web }
///   template:
///     image: nginx:1.27
///     labels: { app: web, tier: frontend }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicaSet {
    pub name: String,
    pub spec: ReplicaSetSpec,
    #[serde(default)]
    pub metadata: ObjectMeta,
}

/// The mutable part of a ReplicaSet. Fields left as `None` are kept.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicaSetUpdate {
    #[serde(default)]
    pub replicas: Option<u32>,
    #[serde(default)]
    pub template: Option<PodTemplate>,
}

impl ReplicaSetUpdate {
    pub fn scale(replicas: u32) -> Self {
        Self {
            replicas: Some(replicas),
            template: None,
        }
    }

    /// Apply onto a spec, returning true if anything changed.
    pub fn apply_to(&self, spec: &mut ReplicaSetSpec) -> bool {
        let mut changed = false;
        if let Some(replicas) = self.replicas
            && replicas != spec.replicas
        {
            spec.replicas = replicas;
            changed = true;
        }
        if let Some(template) = &self.template
            && *template != spec.template
        {
            spec.template = template.clone();
            changed = true;
        }
        changed
    }
}

// --- ReplicaSet status ---

/// Read-only projection computed on demand from the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicaSetStatus {
    pub name: String,
    pub desired: u32,
    /// Owned pods that are not terminating.
    pub live: u32,
    pub pending: u32,
    pub running: u32,
    pub terminating: u32,
    pub resource_version: u64,
    /// Error from the most recent reconciliation, cleared on success.
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_reconciled_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ReplicaSetSpec {
        ReplicaSetSpec {
            replicas: 3,
            selector: HashMap::from([("app".to_string(), "web".to_string())]),
            template: PodTemplate {
                image: "nginx:1.27".to_string(),
                labels: HashMap::from([("app".to_string(), "web".to_string())]),
                node_affinity: HashMap::new(),
            },
        }
    }

    #[test]
    fn update_reports_changes_only_when_values_differ() {
        let mut s = spec();
        assert!(!ReplicaSetUpdate::scale(3).apply_to(&mut s));
        assert!(ReplicaSetUpdate::scale(1).apply_to(&mut s));
        assert_eq!(s.replicas, 1);
        assert!(!ReplicaSetUpdate::default().apply_to(&mut s));
    }

    #[test]
    fn manifest_parses_from_yaml() {
        let yaml = r#"
name: web
spec:
  replicas: 2
  selector: { app: web }
  template:
    image: nginx:1.27
    labels: { app: web }
"#;
        let rs: ReplicaSet = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rs.name, "web");
        assert_eq!(rs.spec.replicas, 2);
        assert_eq!(rs.metadata.resource_version, 0);
    }
}
