//! Centralized constants for the replicore project.
//!
//! All project-wide default values live here.
//! Change a value in one place and it applies everywhere.

pub mod controller;
pub mod network;
pub mod paths;
pub mod scheduler;
pub mod state;
