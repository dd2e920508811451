//! Structured reconcile events and the sinks that receive them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReconcileAction {
    CreatePod { pod: String },
    DeletePod { pod: String },
    /// The reconciliation as a whole failed.
    Error,
}

impl ReconcileAction {
    pub fn label(&self) -> &'static str {
        match self {
            ReconcileAction::CreatePod { .. } => "create",
            ReconcileAction::DeletePod { .. } => "delete",
            ReconcileAction::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum EventResult {
    Success,
    Failure(String),
}

impl EventResult {
    pub fn is_success(&self) -> bool {
        matches!(self, EventResult::Success)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileEvent {
    /// ReplicaSet name the reconciliation ran for.
    pub key: String,
    pub action: ReconcileAction,
    pub result: EventResult,
    pub timestamp: DateTime<Utc>,
}

impl ReconcileEvent {
    pub fn new(key: &str, action: ReconcileAction, result: EventResult) -> Self {
        Self {
            key: key.to_string(),
            action,
            result,
            timestamp: Utc::now(),
        }
    }
}

/// Receiver for every create, delete and error the reconciler produces.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ReconcileEvent);
}

/// Writes events as structured `tracing` records.
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: ReconcileEvent) {
        let pod = match &event.action {
            ReconcileAction::CreatePod { pod } | ReconcileAction::DeletePod { pod } => {
                pod.as_str()
            }
            ReconcileAction::Error => "",
        };
        match &event.result {
            EventResult::Success => info!(
                key = %event.key,
                action = event.action.label(),
                pod,
                timestamp = %event.timestamp,
                "reconcile action succeeded"
            ),
            EventResult::Failure(message) => warn!(
                key = %event.key,
                action = event.action.label(),
                pod,
                error = %message,
                timestamp = %event.timestamp,
                "reconcile action failed"
            ),
        }
    }
}

/// Keeps every event in memory; handy for inspection in tests.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<ReconcileEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ReconcileEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, label: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.action.label() == label)
            .count()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: ReconcileEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Forwards each event to every inner sink.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: ReconcileEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}
