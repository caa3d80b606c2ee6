//! High-level operations.
//!
//! This module contains the environment registry and the lockfile
//! freshness checks it relies on.

pub mod lockfile;
pub mod registry;

pub use lockfile::{compute_manifest_hash, is_fresh};
pub use registry::{
    validate_env_name, EnvError, EnvironmentLease, EnvironmentRegistry, EnvironmentSummary,
    GcReport, VirtualEnvironment,
};
