//! Authoritative in-memory state for the control plane.

pub mod store;
pub mod watch;

pub use store::Store;
pub use watch::{EventType, WatchEvent, Watcher};
