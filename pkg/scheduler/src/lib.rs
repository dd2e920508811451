pub mod binder;

use pkg_types::node::Node;
use pkg_types::pod::Pod;
use pkg_types::{ControlError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};
use tracing::info;

pub use binder::SchedulingLoop;

/// Picks a node for a pod. Implementations must be cheap and non-blocking;
/// the binding itself happens through ordinary store writes.
pub trait NodeAssigner: Send + Sync {
    /// Returns the chosen node name, or `Scheduling` with a reason.
    fn assign_node(&self, pod: &Pod) -> Result<String>;
}

/// Round-robin scheduler with filtering for cordoned nodes and node affinity.
pub struct RoundRobinScheduler {
    nodes: RwLock<Vec<Node>>,
    round_robin_index: AtomicUsize,
}

impl RoundRobinScheduler {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            nodes: RwLock::new(nodes),
            round_robin_index: AtomicUsize::new(0),
        }
    }

    /// Replace the node inventory, e.g. after a cordon.
    pub fn set_nodes(&self, nodes: Vec<Node>) {
        *self.nodes.write().unwrap_or_else(PoisonError::into_inner) = nodes;
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Check if a node is eligible to run this pod.
    fn is_node_eligible(node: &Node, pod: &Pod) -> bool {
        if node.unschedulable {
            return false;
        }

        // All required labels must match exactly
        pod.node_affinity
            .iter()
            .all(|(key, value)| node.labels.get(key) == Some(value))
    }
}

impl NodeAssigner for RoundRobinScheduler {
    fn assign_node(&self, pod: &Pod) -> Result<String> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        let eligible: Vec<&Node> = nodes
            .iter()
            .filter(|n| Self::is_node_eligible(n, pod))
            .collect();

        if eligible.is_empty() {
            info!("No eligible nodes for pod {}", pod.id);
            let reason = if nodes.is_empty() {
                "no nodes registered".to_string()
            } else if pod.node_affinity.is_empty() {
                format!("0/{} nodes are schedulable", nodes.len())
            } else {
                format!("0/{} nodes match node affinity", nodes.len())
            };
            return Err(ControlError::Scheduling {
                pod: pod.id.clone(),
                reason,
            });
        }

        let idx = self.round_robin_index.fetch_add(1, Ordering::Relaxed) % eligible.len();
        let selected = eligible[idx];

        info!("Scheduled pod {} → node {}", pod.id, selected.name);
        Ok(selected.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::pod::PodTemplate;
    use std::collections::HashMap;

    fn make_pod(id: &str, affinity: &[(&str, &str)]) -> Pod {
        let template = PodTemplate {
            image: "nginx:latest".to_string(),
            labels: HashMap::from([("app".to_string(), "web".to_string())]),
            node_affinity: affinity
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        Pod::from_template(id.to_string(), "web", &template)
    }

    #[test]
    fn test_schedule_round_robin() {
        let scheduler = RoundRobinScheduler::new(vec![Node::new("node-1"), Node::new("node-2")]);
        let pod = make_pod("web-a", &[]);

        let first = scheduler.assign_node(&pod).unwrap();
        let second = scheduler.assign_node(&pod).unwrap();
        let third = scheduler.assign_node(&pod).unwrap();

        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn test_skip_cordoned_nodes() {
        let mut cordoned = Node::new("node-1");
        cordoned.unschedulable = true;
        let scheduler = RoundRobinScheduler::new(vec![cordoned, Node::new("node-2")]);
        let pod = make_pod("web-a", &[]);

        for _ in 0..3 {
            assert_eq!(scheduler.assign_node(&pod).unwrap(), "node-2");
        }
    }

    #[test]
    fn test_affinity_filters_nodes() {
        let scheduler = RoundRobinScheduler::new(vec![
            Node::new("node-1").with_label("disk", "hdd"),
            Node::new("node-2").with_label("disk", "ssd").with_label("zone", "a"),
        ]);
        let pod = make_pod("web-a", &[("disk", "ssd")]);
        assert_eq!(scheduler.assign_node(&pod).unwrap(), "node-2");

        let pod = make_pod("web-b", &[("disk", "ssd"), ("zone", "b")]);
        let err = scheduler.assign_node(&pod).unwrap_err();
        assert_eq!(
            err,
            ControlError::Scheduling {
                pod: "web-b".to_string(),
                reason: "0/2 nodes match node affinity".to_string(),
            }
        );
    }

    #[test]
    fn test_no_nodes() {
        let scheduler = RoundRobinScheduler::new(vec![]);
        let err = scheduler.assign_node(&make_pod("web-a", &[])).unwrap_err();
        assert!(err.to_string().contains("no nodes registered"));

        scheduler.set_nodes(vec![Node::new("node-1")]);
        assert_eq!(scheduler.assign_node(&make_pod("web-a", &[])).unwrap(), "node-1");
        assert_eq!(scheduler.nodes().len(), 1);
    }
}
