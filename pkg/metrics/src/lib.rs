pub mod sink;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

pub use sink::MetricsSink;

/// Reconcile actions by `action` and `result` label.
pub const RECONCILE_ACTIONS_TOTAL: &str = "replicore_reconcile_actions_total";
/// Work queue depth, sampled at scrape time.
pub const WORKQUEUE_DEPTH: &str = "replicore_workqueue_depth";
/// Latest store revision, sampled at scrape time.
pub const STORE_REVISION: &str = "replicore_store_revision";
pub const REPLICASETS: &str = "replicore_replicasets";
pub const PODS: &str = "replicore_pods";

/// A lightweight, thread-safe metrics registry that renders in Prometheus text exposition format.
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<String, Counter>>,
    gauges: RwLock<BTreeMap<String, Gauge>>,
}

/// Monotonically increasing counter, one value per label set.
struct Counter {
    help: String,
    series: BTreeMap<String, AtomicU64>,
}

/// Value that can go up or down.
struct Gauge {
    value: AtomicI64,
    help: String,
}

fn label_key(labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let pairs: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("{{{}}}", pairs.join(","))
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(BTreeMap::new()),
            gauges: RwLock::new(BTreeMap::new()),
        }
    }

    /// Registry with every series this server exports.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register_counter(
            RECONCILE_ACTIONS_TOTAL,
            "Pod creations, deletions and reconcile errors",
        );
        registry.register_gauge(WORKQUEUE_DEPTH, "Keys waiting in the work queue");
        registry.register_gauge(STORE_REVISION, "Latest revision of the state store");
        registry.register_gauge(REPLICASETS, "ReplicaSets in the state store");
        registry.register_gauge(PODS, "Pods in the state store");
        registry
    }

    /// Register a counter. If it already exists, this is a no-op.
    pub fn register_counter(&self, name: &str, help: &str) {
        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        counters.entry(name.to_string()).or_insert_with(|| Counter {
            help: help.to_string(),
            series: BTreeMap::new(),
        });
    }

    /// Register a gauge. If it already exists, this is a no-op.
    pub fn register_gauge(&self, name: &str, help: &str) {
        let mut gauges = self.gauges.write().unwrap_or_else(PoisonError::into_inner);
        gauges.entry(name.to_string()).or_insert_with(|| Gauge {
            value: AtomicI64::new(0),
            help: help.to_string(),
        });
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)]) {
        self.counter_add(name, labels, 1);
    }

    /// Increment one series of a registered counter. Unknown names are ignored.
    pub fn counter_add(&self, name: &str, labels: &[(&str, &str)], val: u64) {
        let key = label_key(labels);
        {
            let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
            match counters.get(name) {
                None => return,
                Some(c) => {
                    if let Some(v) = c.series.get(&key) {
                        v.fetch_add(val, Ordering::Relaxed);
                        return;
                    }
                }
            }
        }
        // First sighting of this label set.
        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(c) = counters.get_mut(name) {
            c.series
                .entry(key)
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(val, Ordering::Relaxed);
        }
    }

    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        counters
            .get(name)
            .and_then(|c| c.series.get(&label_key(labels)))
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Set a gauge to a specific value.
    pub fn gauge_set(&self, name: &str, val: i64) {
        let gauges = self.gauges.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(g) = gauges.get(name) {
            g.value.store(val, Ordering::Relaxed);
        }
    }

    pub fn gauge_value(&self, name: &str) -> Option<i64> {
        let gauges = self.gauges.read().unwrap_or_else(PoisonError::into_inner);
        gauges.get(name).map(|g| g.value.load(Ordering::Relaxed))
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut output = String::new();

        let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        for (name, counter) in counters.iter() {
            output.push_str(&format!("# HELP {} {}\n", name, counter.help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            for (labels, value) in &counter.series {
                output.push_str(&format!(
                    "{}{} {}\n",
                    name,
                    labels,
                    value.load(Ordering::Relaxed)
                ));
            }
        }

        let gauges = self.gauges.read().unwrap_or_else(PoisonError::into_inner);
        for (name, gauge) in gauges.iter() {
            output.push_str(&format!("# HELP {} {}\n", name, gauge.help));
            output.push_str(&format!("# TYPE {} gauge\n", name));
            output.push_str(&format!(
                "{} {}\n",
                name,
                gauge.value.load(Ordering::Relaxed)
            ));
        }

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
