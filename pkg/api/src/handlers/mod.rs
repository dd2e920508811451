pub mod health;
pub mod pods;
pub mod replicasets;
pub mod watch;
