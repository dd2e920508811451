pub mod informer;
pub mod manager;
pub mod replicaset;
pub mod status;
pub mod workqueue;

pub use manager::{ControllerConfig, ControllerManager};
