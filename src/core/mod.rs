//! Core data structures for berth.
//!
//! This module contains the foundational types used throughout the crate:
//! - Validated package names and version constraints
//! - Artifacts and their content fingerprints
//! - Package versions as published by an index
//! - Manifests and dependencies

pub mod artifact;
pub mod constraint;
pub mod dependency;
pub mod manifest;
pub mod name;
pub mod package_id;
pub mod package_version;

pub use artifact::{Artifact, ArtifactKind, Fingerprint};
pub use constraint::VersionConstraint;
pub use dependency::Dependency;
pub use manifest::{Manifest, ManifestError, PackageSpec, MANIFEST_NAME};
pub use name::PackageName;
pub use package_id::PackageId;
pub use package_version::PackageVersion;
