//! Dependency specification.
//!
//! A Dependency is an edge from a package version to another package name,
//! restricted by a parsed version constraint.

use std::collections::BTreeMap;
use std::fmt;

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::core::constraint::VersionConstraint;
use crate::core::name::PackageName;

/// A dependency on another package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    name: PackageName,
    constraint: VersionConstraint,
}

impl Dependency {
    /// Create a new dependency.
    pub fn new(name: PackageName, constraint: VersionConstraint) -> Self {
        Dependency { name, constraint }
    }

    /// Get the package name.
    pub fn name(&self) -> &PackageName {
        &self.name
    }

    /// Get the version constraint.
    pub fn constraint(&self) -> &VersionConstraint {
        &self.constraint
    }

    /// Check if a version matches this dependency's constraint.
    pub fn matches_version(&self, version: &Version) -> bool {
        self.constraint.matches(version)
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.constraint)
    }
}

/// Dependency specification as written in a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencySpec {
    /// Simple constraint string: `fmt = "^10.1"`
    Simple(String),

    /// Detailed specification
    Detailed(DetailedDependencySpec),
}

/// Detailed dependency specification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetailedDependencySpec {
    /// Version constraint (defaults to `*`)
    #[serde(default)]
    pub version: Option<String>,

    /// Build options passed through to the build description
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl DependencySpec {
    /// The raw constraint string, `*` when omitted.
    pub fn constraint_str(&self) -> &str {
        match self {
            DependencySpec::Simple(s) => s,
            DependencySpec::Detailed(d) => d.version.as_deref().unwrap_or("*"),
        }
    }

    /// Build options declared for the dependency.
    pub fn options(&self) -> BTreeMap<String, String> {
        match self {
            DependencySpec::Simple(_) => BTreeMap::new(),
            DependencySpec::Detailed(d) => d.options.clone(),
        }
    }
}
