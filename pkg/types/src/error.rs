use thiserror::Error;

use crate::object::Kind;

/// Failures shared by the store, controllers and the inbound API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: Kind, name: String },

    #[error("conflict on {kind} '{name}': expected resource version {expected}, found {actual}")]
    Conflict {
        kind: Kind,
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: Kind, name: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("pod '{pod}' could not be scheduled: {reason}")]
    Scheduling { pod: String, reason: String },

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    /// Store invariants no longer hold. The only condition that halts a worker.
    #[error("store corrupted: {0}")]
    Corrupted(String),
}

impl ControlError {
    pub fn not_found(kind: Kind, name: impl Into<String>) -> Self {
        ControlError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ControlError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ControlError::Conflict { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ControlError::Corrupted(_))
    }
}

pub type Result<T, E = ControlError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_object() {
        let err = ControlError::not_found(Kind::Pod, "web-1");
        assert_eq!(err.to_string(), "Pod 'web-1' not found");
        assert!(err.is_not_found());
        assert!(!err.is_fatal());

        let err = ControlError::Conflict {
            kind: Kind::ReplicaSet,
            name: "web".to_string(),
            expected: 3,
            actual: 5,
        };
        assert!(err.is_conflict());
        assert!(err.to_string().contains("expected resource version 3"));
    }
}
