//! Shared data model for the replicore control plane.

pub mod config;
pub mod error;
pub mod event;
pub mod node;
pub mod object;
pub mod pod;
pub mod replicaset;
pub mod selector;
pub mod validate;

pub use error::{ControlError, Result};
pub use object::{Kind, Object, ObjectMeta};
