use pkg_types::event::{EventResult, EventSink, ReconcileEvent};
use std::sync::Arc;

use crate::{MetricsRegistry, RECONCILE_ACTIONS_TOTAL};

/// Counts reconcile events by action and result.
#[derive(Clone)]
pub struct MetricsSink {
    registry: Arc<MetricsRegistry>,
}

impl MetricsSink {
    pub fn new(registry: Arc<MetricsRegistry>) -> Self {
        Self { registry }
    }
}

impl EventSink for MetricsSink {
    fn emit(&self, event: ReconcileEvent) {
        let result = match event.result {
            EventResult::Success => "success",
            EventResult::Failure(_) => "failure",
        };
        self.registry.counter_inc(
            RECONCILE_ACTIONS_TOTAL,
            &[("action", event.action.label()), ("result", result)],
        );
    }
}
