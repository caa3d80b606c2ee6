//! Lockfile encoding and decoding.
//!
//! berth.lock records the exact outcome of a resolution, in dependency
//! order, with everything needed to rebuild the environment from the cache
//! alone: fingerprints, artifact kinds, mirrors, link names and options.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::core::artifact::{Artifact, ArtifactKind, Fingerprint};
use crate::core::manifest::Manifest;
use crate::core::name::PackageName;
use crate::core::package_id::PackageId;
use crate::resolver::graph::DependencyGraph;
use crate::util::fs::write_atomic;

/// Canonical lockfile name inside an environment root.
pub const LOCKFILE_NAME: &str = "berth.lock";

/// Current lockfile format version.
pub const LOCKFILE_VERSION: u32 = 1;

/// Lockfile representation for serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lockfile {
    /// Lockfile format version
    pub version: u32,

    /// Hash of the manifest this lockfile was resolved from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_hash: Option<String>,

    /// Locked packages, dependencies before dependants
    #[serde(rename = "package", default)]
    pub packages: Vec<LockedPackage>,
}

/// A locked package entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedPackage {
    /// Package name
    pub name: PackageName,

    /// Exact version
    pub version: Version,

    /// Artifact fingerprint
    pub fingerprint: Fingerprint,

    /// Artifact kind
    #[serde(default)]
    pub kind: ArtifactKind,

    /// Mirror URLs, tried in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,

    /// Declared link names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,

    /// Names of direct dependencies
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<PackageName>,

    /// Build options from the manifest
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl LockedPackage {
    /// The artifact to acquire for this package.
    pub fn artifact(&self) -> Artifact {
        Artifact::new(self.fingerprint.clone(), self.kind, self.urls.clone())
    }

    pub fn package_id(&self) -> PackageId {
        PackageId::new(self.name.clone(), self.version.clone())
    }
}

impl Lockfile {
    /// Create a lockfile from a resolved graph.
    ///
    /// Build options are taken from the manifest entry of the same name.
    pub fn from_graph(graph: &DependencyGraph, manifest: &Manifest) -> Self {
        let packages = graph
            .dependency_order()
            .into_iter()
            .map(|pkg| LockedPackage {
                name: pkg.name().clone(),
                version: pkg.version().clone(),
                fingerprint: pkg.fingerprint().clone(),
                kind: pkg.kind(),
                urls: pkg.artifact().urls.clone(),
                links: pkg.links().to_vec(),
                dependencies: pkg.dependencies().iter().map(|d| d.name().clone()).collect(),
                options: manifest
                    .package(pkg.name())
                    .map(|spec| spec.options().clone())
                    .unwrap_or_default(),
            })
            .collect();

        Lockfile {
            version: LOCKFILE_VERSION,
            manifest_hash: None,
            packages,
        }
    }

    /// Set the manifest hash for freshness detection.
    pub fn with_manifest_hash(mut self, hash: String) -> Self {
        self.manifest_hash = Some(hash);
        self
    }

    /// Get the manifest hash, if present.
    pub fn manifest_hash(&self) -> Option<&str> {
        self.manifest_hash.as_deref()
    }

    /// Look up a locked package by name.
    pub fn package(&self, name: &str) -> Option<&LockedPackage> {
        self.packages.iter().find(|p| p.name.as_str() == name)
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Check if the lockfile format is understood.
    pub fn is_compatible(&self) -> bool {
        self.version == LOCKFILE_VERSION
    }

    /// Serialize with the generated-file header.
    pub fn to_toml_string(&self) -> Result<String> {
        let content = toml::to_string_pretty(self).context("failed to serialize lockfile")?;

        Ok(format!(
            "# This file is automatically generated by berth.\n\
             # It is not intended for manual editing.\n\n\
             {content}"
        ))
    }

    /// Parse lockfile content.
    pub fn parse(content: &str) -> Result<Self> {
        let lockfile: Lockfile = toml::from_str(content).context("failed to parse lockfile")?;
        if !lockfile.is_compatible() {
            anyhow::bail!(
                "lockfile version {} is not compatible with this version of berth",
                lockfile.version
            );
        }
        Ok(lockfile)
    }

    /// Load a lockfile from a path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read lockfile: {}", path.display()))?;

        Self::parse(&content).with_context(|| format!("in {}", path.display()))
    }

    /// Save the lockfile to a path.
    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, self.to_toml_string()?.as_bytes())
            .with_context(|| format!("failed to write lockfile: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::resolve;
    use crate::sources::index::MemoryIndex;
    use crate::test_support::{manifest, pkg};
    use tempfile::TempDir;

    fn index() -> MemoryIndex {
        MemoryIndex::new()
            .with(pkg("zlib", "1.3.1", &[]))
            .with(pkg("png", "1.6.40", &[("zlib", "^1.2")]))
    }

    #[test]
    fn test_lockfile_in_dependency_order() {
        let m = Manifest::parse(
            "[dependencies]\npng = { version = \"^1.6\", options = { shared = \"off\" } }\n",
        )
        .unwrap();
        let graph = resolve(&m, &index()).unwrap();

        let lockfile = Lockfile::from_graph(&graph, &m);
        let names: Vec<_> = lockfile.packages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["zlib", "png"]);

        let png = lockfile.package("png").unwrap();
        assert_eq!(png.options["shared"], "off");
        assert_eq!(png.dependencies, [PackageName::new("zlib").unwrap()]);
    }

    #[test]
    fn test_lockfile_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let m = manifest(&[("png", "*")]);
        let graph = resolve(&m, &index()).unwrap();
        let lockfile = Lockfile::from_graph(&graph, &m).with_manifest_hash("abc".into());

        let path = tmp.path().join(LOCKFILE_NAME);
        lockfile.save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# This file is automatically generated by berth."));
        assert!(text.contains("[[package]]"));

        let loaded = Lockfile::load(&path).unwrap();
        assert_eq!(loaded, lockfile);
        assert_eq!(loaded.manifest_hash(), Some("abc"));
    }

    #[test]
    fn test_same_resolution_same_bytes() {
        let m = manifest(&[("png", "*"), ("zlib", "*")]);
        let a = Lockfile::from_graph(&resolve(&m, &index()).unwrap(), &m);
        let b = Lockfile::from_graph(&resolve(&m, &index()).unwrap(), &m);
        assert_eq!(a.to_toml_string().unwrap(), b.to_toml_string().unwrap());
    }

    #[test]
    fn test_incompatible_version_rejected() {
        let err = Lockfile::parse("version = 99\n").unwrap_err();
        assert!(err.to_string().contains("not compatible"));
    }
}
