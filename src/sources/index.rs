//! Package index - the read-only feed of available package versions.
//!
//! The resolver only ever asks an index one question: which versions of a
//! package exist. `DirectoryIndex` answers it from a tree of TOML files,
//! `MemoryIndex` from versions registered in code.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::core::artifact::{Artifact, ArtifactKind, Fingerprint};
use crate::core::constraint::{parse_version_lenient, VersionConstraint};
use crate::core::dependency::Dependency;
use crate::core::name::PackageName;
use crate::core::package_version::PackageVersion;

/// A source of package versions.
pub trait PackageIndex: Send + Sync {
    /// Get the index name for display.
    fn name(&self) -> &str;

    /// All published versions of `name`, in any order.
    ///
    /// An unknown package yields an empty list, not an error.
    fn query(&self, name: &PackageName) -> Result<Vec<PackageVersion>>;
}

/// An index held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryIndex {
    versions: BTreeMap<PackageName, Vec<PackageVersion>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a version, replacing an existing entry with the same version.
    pub fn insert(&mut self, version: PackageVersion) {
        let list = self.versions.entry(version.name().clone()).or_default();
        list.retain(|v| v.version() != version.version());
        list.push(version);
    }

    /// Builder-style `insert`.
    pub fn with(mut self, version: PackageVersion) -> Self {
        self.insert(version);
        self
    }

    pub fn len(&self) -> usize {
        self.versions.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

impl PackageIndex for MemoryIndex {
    fn name(&self) -> &str {
        "memory"
    }

    fn query(&self, name: &PackageName) -> Result<Vec<PackageVersion>> {
        Ok(self.versions.get(name).cloned().unwrap_or_default())
    }
}

/// An index stored as `<root>/<first-letter>/<name>.toml` files.
#[derive(Debug, Clone)]
pub struct DirectoryIndex {
    root: PathBuf,
}

/// One index file: every published version of a package.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IndexFile {
    #[serde(default, rename = "version")]
    versions: Vec<IndexEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IndexEntry {
    version: String,
    fingerprint: Fingerprint,
    #[serde(default)]
    kind: ArtifactKind,
    #[serde(default)]
    urls: Vec<String>,
    #[serde(default)]
    links: Vec<String>,
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
}

impl DirectoryIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirectoryIndex { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the index file for `name`.
    pub fn entry_path(&self, name: &PackageName) -> PathBuf {
        self.root
            .join(name.first_char().to_string())
            .join(format!("{}.toml", name))
    }

    fn convert(name: &PackageName, entry: IndexEntry) -> Result<PackageVersion> {
        let version = parse_version_lenient(&entry.version)
            .ok_or_else(|| anyhow!("invalid version `{}` for {}", entry.version, name))?;

        let mut dependencies = Vec::with_capacity(entry.dependencies.len());
        for (dep_name, constraint) in entry.dependencies {
            let dep_name = PackageName::new(&dep_name)
                .with_context(|| format!("in dependencies of {} {}", name, version))?;
            let constraint = VersionConstraint::parse(&constraint)
                .with_context(|| format!("in dependencies of {} {}", name, version))?;
            dependencies.push(Dependency::new(dep_name, constraint));
        }

        let artifact = Artifact::new(entry.fingerprint, entry.kind, entry.urls);
        Ok(PackageVersion::new(name.clone(), version, dependencies, artifact)
            .with_links(entry.links))
    }
}

impl PackageIndex for DirectoryIndex {
    fn name(&self) -> &str {
        "directory"
    }

    fn query(&self, name: &PackageName) -> Result<Vec<PackageVersion>> {
        let path = self.entry_path(name);
        if !path.exists() {
            tracing::debug!("no index entry for {} at {}", name, path.display());
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read index entry: {}", path.display()))?;
        let file: IndexFile = toml::from_str(&content)
            .with_context(|| format!("failed to parse index entry: {}", path.display()))?;

        file.versions
            .into_iter()
            .map(|entry| Self::convert(name, entry))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use semver::Version;
    use tempfile::TempDir;

    const FP: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_directory_index_query() {
        let tmp = TempDir::new().unwrap();
        let index = DirectoryIndex::new(tmp.path());
        let name = PackageName::new("lib-a").unwrap();
        let path = index.entry_path(&name);
        assert!(path.ends_with("l/lib-a.toml"));

        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            format!(
                r#"
[[version]]
version = "1.8.0"
fingerprint = "sha256:{FP}"
urls = ["file:///mirror/lib-a-1.8.0.tar.gz"]
links = ["a"]

[version.dependencies]
lib-c = ">=2.0"

[[version]]
version = "1.0.0"
fingerprint = "{FP}"
kind = "source"
"#
            ),
        )
        .unwrap();

        let versions = index.query(&name).unwrap();
        assert_eq!(versions.len(), 2);

        let newest = &versions[0];
        assert_eq!(newest.version(), &Version::new(1, 8, 0));
        assert_eq!(newest.links(), ["a"]);
        assert_eq!(newest.dependencies()[0].to_string(), "lib-c >=2.0");
        assert_eq!(versions[1].kind(), ArtifactKind::Source);
    }

    #[test]
    fn test_directory_index_short_versions() {
        let tmp = TempDir::new().unwrap();
        let index = DirectoryIndex::new(tmp.path());
        let name = PackageName::new("zlib").unwrap();
        let path = index.entry_path(&name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            format!("[[version]]\nversion = \"1.3\"\nfingerprint = \"{FP}\"\n"),
        )
        .unwrap();

        let versions = index.query(&name).unwrap();
        assert_eq!(versions[0].version(), &Version::new(1, 3, 0));
    }

    #[test]
    fn test_directory_index_unknown_package() {
        let tmp = TempDir::new().unwrap();
        let index = DirectoryIndex::new(tmp.path());
        let versions = index.query(&PackageName::new("nope").unwrap()).unwrap();
        assert!(versions.is_empty());
    }

    #[test]
    fn test_directory_index_rejects_bad_constraint() {
        let tmp = TempDir::new().unwrap();
        let index = DirectoryIndex::new(tmp.path());
        let name = PackageName::new("fmt").unwrap();
        let path = index.entry_path(&name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            format!(
                "[[version]]\nversion = \"10.1.0\"\nfingerprint = \"{FP}\"\n\
                 [version.dependencies]\nzlib = \"~>1\"\n"
            ),
        )
        .unwrap();

        assert!(index.query(&name).is_err());
    }

    #[test]
    fn test_memory_index_replaces_same_version() {
        let name = PackageName::new("zlib").unwrap();
        let artifact = Artifact::new(Fingerprint::parse(FP).unwrap(), ArtifactKind::Binary, vec![]);
        let pv = PackageVersion::new(name.clone(), Version::new(1, 3, 0), vec![], artifact);

        let index = MemoryIndex::new().with(pv.clone()).with(pv);
        assert_eq!(index.query(&name).unwrap().len(), 1);
        assert_eq!(index.len(), 1);
    }
}
