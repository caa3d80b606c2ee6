//! PackageVersion - one concrete, fetchable version of a package.
//!
//! This is what the package index returns and what the resolver chooses
//! between. It's designed to be cheap to clone.

use std::sync::Arc;

use semver::Version;

use crate::core::artifact::{Artifact, ArtifactKind, Fingerprint};
use crate::core::dependency::Dependency;
use crate::core::name::PackageName;
use crate::core::package_id::PackageId;

/// A concrete package version.
///
/// PackageVersions are Arc-wrapped internally for cheap cloning.
#[derive(Clone)]
pub struct PackageVersion {
    inner: Arc<Inner>,
}

#[derive(Clone)]
struct Inner {
    name: PackageName,
    version: Version,
    dependencies: Vec<Dependency>,
    artifact: Artifact,
    links: Vec<String>,
}

impl PackageVersion {
    /// Create a new package version.
    ///
    /// Dependencies are kept sorted by name so traversal order is stable.
    pub fn new(
        name: PackageName,
        version: Version,
        mut dependencies: Vec<Dependency>,
        artifact: Artifact,
    ) -> Self {
        dependencies.sort_by(|a, b| a.name().cmp(b.name()));
        PackageVersion {
            inner: Arc::new(Inner {
                name,
                version,
                dependencies,
                artifact,
                links: Vec::new(),
            }),
        }
    }

    /// Declare the link names this package provides.
    pub fn with_links(mut self, links: Vec<String>) -> Self {
        let inner = Arc::make_mut(&mut self.inner);
        inner.links = links;
        self
    }

    /// Get the package name.
    pub fn name(&self) -> &PackageName {
        &self.inner.name
    }

    /// Get the package version.
    pub fn version(&self) -> &Version {
        &self.inner.version
    }

    /// Name and version as an id.
    pub fn package_id(&self) -> PackageId {
        PackageId::new(self.inner.name.clone(), self.inner.version.clone())
    }

    /// Get the direct dependencies.
    pub fn dependencies(&self) -> &[Dependency] {
        &self.inner.dependencies
    }

    /// Get the artifact description.
    pub fn artifact(&self) -> &Artifact {
        &self.inner.artifact
    }

    /// Get the artifact fingerprint.
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.inner.artifact.fingerprint
    }

    /// Get the artifact kind.
    pub fn kind(&self) -> ArtifactKind {
        self.inner.artifact.kind
    }

    /// Declared link names (empty means "discover from lib/").
    pub fn links(&self) -> &[String] {
        &self.inner.links
    }

    /// Display string like "name 1.2.3".
    pub fn display_name(&self) -> String {
        format!("{} {}", self.inner.name, self.inner.version)
    }
}

impl std::fmt::Debug for PackageVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageVersion")
            .field("name", &self.inner.name)
            .field("version", &self.inner.version)
            .field("dependencies", &self.inner.dependencies.len())
            .field("fingerprint", &self.inner.artifact.fingerprint)
            .finish()
    }
}

impl std::fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} v{}", self.inner.name, self.inner.version)
    }
}

impl PartialEq for PackageVersion {
    fn eq(&self, other: &Self) -> bool {
        self.inner.name == other.inner.name && self.inner.version == other.inner.version
    }
}

impl Eq for PackageVersion {}

impl std::hash::Hash for PackageVersion {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.name.hash(state);
        self.inner.version.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constraint::VersionConstraint;

    fn artifact() -> Artifact {
        Artifact::new(
            Fingerprint::parse(&"ab".repeat(32)).unwrap(),
            ArtifactKind::Binary,
            vec![],
        )
    }

    #[test]
    fn test_dependencies_sorted() {
        let dep = |n: &str| {
            Dependency::new(PackageName::new(n).unwrap(), VersionConstraint::any())
        };
        let pv = PackageVersion::new(
            PackageName::new("app").unwrap(),
            Version::new(1, 0, 0),
            vec![dep("zlib"), dep("fmt")],
            artifact(),
        );

        let names: Vec<_> = pv.dependencies().iter().map(|d| d.name().as_str()).collect();
        assert_eq!(names, ["fmt", "zlib"]);
        assert_eq!(pv.display_name(), "app 1.0.0");
    }

    #[test]
    fn test_cheap_clone() {
        let pv = PackageVersion::new(
            PackageName::new("fmt").unwrap(),
            Version::new(10, 1, 0),
            vec![],
            artifact(),
        )
        .with_links(vec!["fmt".to_string()]);
        let copy = pv.clone();

        assert!(Arc::ptr_eq(&pv.inner, &copy.inner));
        assert_eq!(copy.links(), ["fmt"]);
    }
}
