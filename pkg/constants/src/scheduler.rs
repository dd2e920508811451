//! Scheduler stub defaults.

/// How often unbound pods are re-offered to the node assigner, in seconds.
pub const DEFAULT_SCHEDULER_RETRY_SECS: u64 = 5;

/// Node used when the config file does not list any.
pub const DEFAULT_NODE_NAME: &str = "node-1";
