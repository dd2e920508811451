use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::object::Object;

/// Exact-match label selector, optionally narrowed to one owner.
///
/// Every listed label must be present with the same value (AND semantics).
/// An empty selector matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Selector {
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Matches only objects whose owner back-reference equals this name.
    #[serde(default)]
    pub owner: Option<String>,
}

impl Selector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn owned_by(owner: impl Into<String>) -> Self {
        Self {
            labels: HashMap::new(),
            owner: Some(owner.into()),
        }
    }

    pub fn with_labels(labels: HashMap<String, String>) -> Self {
        Self {
            labels,
            owner: None,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn matches_labels(&self, labels: &HashMap<String, String>) -> bool {
        self.labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }

    pub fn matches(&self, object: &Object) -> bool {
        if let Some(owner) = &self.owner
            && object.owner_name() != Some(owner.as_str())
        {
            return false;
        }
        self.matches_labels(object.labels())
    }
}
