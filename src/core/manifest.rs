//! berth.toml manifest parsing and validation.
//!
//! A manifest declares the packages an environment needs. Packages can be
//! listed in a `[dependencies]` table or as `[[package]]` entries; both forms
//! may be mixed as long as no name appears twice.
//!
//! Parsing is pure: `Manifest::parse` never touches the filesystem, and
//! `Manifest::load` only reads the file before delegating to it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use miette::Diagnostic;
use serde::Deserialize;
use thiserror::Error;

use crate::core::constraint::VersionConstraint;
use crate::core::dependency::{Dependency, DependencySpec};
use crate::core::name::PackageName;

/// Canonical manifest file name.
pub const MANIFEST_NAME: &str = "berth.toml";

/// Errors raised while reading a manifest.
#[derive(Debug, Error, Diagnostic)]
pub enum ManifestError {
    #[error("invalid package name `{name}`: {reason}")]
    #[diagnostic(
        code(berth::manifest::invalid_name),
        help("package names are lowercase and match [a-z][a-z0-9_-]*")
    )]
    InvalidName { name: String, reason: String },

    #[error("invalid version constraint `{constraint}` for `{package}`: {reason}")]
    #[diagnostic(
        code(berth::manifest::invalid_constraint),
        help("use operators like `>=1.0,<2.0`, `^1.2`, `~1.2.3`, `1.*` or `*`")
    )]
    InvalidConstraint {
        package: String,
        constraint: String,
        reason: String,
    },

    #[error("package `{name}` is declared more than once")]
    #[diagnostic(code(berth::manifest::duplicate_package))]
    DuplicatePackage { name: String },

    #[error("failed to parse manifest: {message}")]
    #[diagnostic(code(berth::manifest::syntax))]
    Syntax { message: String },

    #[error("failed to read manifest {}", path.display())]
    #[diagnostic(code(berth::manifest::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One required package, as declared by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    name: PackageName,
    constraint: VersionConstraint,
    options: BTreeMap<String, String>,
}

impl PackageSpec {
    pub fn new(
        name: PackageName,
        constraint: VersionConstraint,
        options: BTreeMap<String, String>,
    ) -> Self {
        PackageSpec {
            name,
            constraint,
            options,
        }
    }

    pub fn name(&self) -> &PackageName {
        &self.name
    }

    pub fn constraint(&self) -> &VersionConstraint {
        &self.constraint
    }

    /// Build options passed through to the lockfile and build description.
    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    /// The spec as a resolver edge.
    pub fn to_dependency(&self) -> Dependency {
        Dependency::new(self.name.clone(), self.constraint.clone())
    }
}

/// A parsed and validated manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    /// Optional environment name from `[environment]`.
    environment: Option<String>,

    /// Required packages, sorted by name.
    packages: Vec<PackageSpec>,
}

/// Raw manifest as read from TOML.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    #[serde(default)]
    environment: Option<RawEnvironment>,

    #[serde(default)]
    dependencies: BTreeMap<String, DependencySpec>,

    #[serde(default)]
    package: Vec<RawPackage>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEnvironment {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPackage {
    name: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    options: BTreeMap<String, String>,
}

impl Manifest {
    /// Build a manifest directly from package specs.
    pub fn from_specs(specs: Vec<PackageSpec>) -> Result<Self, ManifestError> {
        let mut seen = BTreeSet::new();
        for spec in &specs {
            if !seen.insert(spec.name.clone()) {
                return Err(ManifestError::DuplicatePackage {
                    name: spec.name.to_string(),
                });
            }
        }

        let mut packages = specs;
        packages.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Manifest {
            environment: None,
            packages,
        })
    }

    /// Load a manifest from a file path.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&content)
    }

    /// Parse manifest content.
    pub fn parse(content: &str) -> Result<Self, ManifestError> {
        let raw: RawManifest = toml::from_str(content).map_err(|e| ManifestError::Syntax {
            message: e.message().to_string(),
        })?;

        let mut specs = Vec::with_capacity(raw.dependencies.len() + raw.package.len());

        for (name, spec) in &raw.dependencies {
            specs.push(convert_spec(name, spec.constraint_str(), spec.options())?);
        }

        for pkg in raw.package {
            let constraint = pkg.version.as_deref().unwrap_or("*");
            specs.push(convert_spec(&pkg.name, constraint, pkg.options)?);
        }

        let mut manifest = Self::from_specs(specs)?;
        manifest.environment = raw.environment.and_then(|e| e.name);
        Ok(manifest)
    }

    /// Environment name declared in the manifest, if any.
    pub fn environment_name(&self) -> Option<&str> {
        self.environment.as_deref()
    }

    /// Required packages in name order.
    pub fn packages(&self) -> &[PackageSpec] {
        &self.packages
    }

    /// Look up a package by name.
    pub fn package(&self, name: &str) -> Option<&PackageSpec> {
        self.packages.iter().find(|p| p.name.as_str() == name)
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Root dependencies for the resolver.
    pub fn dependencies(&self) -> Vec<Dependency> {
        self.packages.iter().map(PackageSpec::to_dependency).collect()
    }
}

fn convert_spec(
    name: &str,
    constraint: &str,
    options: BTreeMap<String, String>,
) -> Result<PackageSpec, ManifestError> {
    let name = PackageName::new(name).map_err(|e| ManifestError::InvalidName {
        name: e.name,
        reason: e.reason,
    })?;

    let constraint =
        VersionConstraint::parse(constraint).map_err(|e| ManifestError::InvalidConstraint {
            package: name.to_string(),
            constraint: constraint.to_string(),
            reason: e.reason,
        })?;

    Ok(PackageSpec::new(name, constraint, options))
}

/// Generate a starter manifest.
pub fn generate_default_manifest(env_name: &str) -> String {
    format!(
        r#"[environment]
name = "{}"

[dependencies]
# fmt = "^10.1"
# abseil = {{ version = ">=20230125", options = {{ shared = "off" }} }}
"#,
        env_name
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use semver::Version;
    use tempfile::TempDir;

    #[test]
    fn test_parse_basic_manifest() {
        let content = r#"
[environment]
name = "demo"

[dependencies]
fmt = "^10.1"
abseil = { version = ">=20230125", options = { shared = "off" } }
"#;
        let manifest = Manifest::parse(content).unwrap();

        assert_eq!(manifest.environment_name(), Some("demo"));
        let names: Vec<_> = manifest.packages().iter().map(|p| p.name().as_str()).collect();
        assert_eq!(names, ["abseil", "fmt"]);

        let abseil = manifest.package("abseil").unwrap();
        assert_eq!(abseil.options()["shared"], "off");
        assert!(abseil.constraint().matches(&Version::new(20230802, 0, 0)));
    }

    #[test]
    fn test_parse_package_array() {
        let content = r#"
[dependencies]
fmt = "10.*"

[[package]]
name = "jsoncpp"
version = "1.9.*"

[[package]]
name = "boost_filesystem"
"#;
        let manifest = Manifest::parse(content).unwrap();
        assert_eq!(manifest.packages().len(), 3);
        assert!(manifest.package("boost_filesystem").unwrap().constraint().is_any());
    }

    #[test]
    fn test_empty_manifest() {
        let manifest = Manifest::parse("").unwrap();
        assert!(manifest.is_empty());
        assert!(manifest.dependencies().is_empty());
    }

    #[test]
    fn test_duplicate_across_forms() {
        let content = r#"
[dependencies]
fmt = "^10"

[[package]]
name = "fmt"
version = "^9"
"#;
        let err = Manifest::parse(content).unwrap_err();
        assert!(matches!(err, ManifestError::DuplicatePackage { ref name } if name == "fmt"));
    }

    #[test]
    fn test_invalid_name() {
        let err = Manifest::parse("[dependencies]\nFmt = \"1.0\"\n").unwrap_err();
        assert!(matches!(err, ManifestError::InvalidName { ref name, .. } if name == "Fmt"));
    }

    #[test]
    fn test_invalid_constraint_names_package() {
        let err = Manifest::parse("[dependencies]\nfmt = \">>1\"\n").unwrap_err();
        match err {
            ManifestError::InvalidConstraint {
                package,
                constraint,
                ..
            } => {
                assert_eq!(package, "fmt");
                assert_eq!(constraint, ">>1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_syntax_error() {
        let err = Manifest::parse("[dependencies\nfmt = 1").unwrap_err();
        assert!(matches!(err, ManifestError::Syntax { .. }));

        let err = Manifest::parse("[dependencies]\nfmt = { path = \"../fmt\" }\n").unwrap_err();
        assert!(matches!(err, ManifestError::Syntax { .. }));
    }

    #[test]
    fn test_load_missing_file() {
        let tmp = TempDir::new().unwrap();
        let err = Manifest::load(&tmp.path().join(MANIFEST_NAME)).unwrap_err();
        assert!(matches!(err, ManifestError::Io { .. }));
    }

    #[test]
    fn test_generated_manifest_parses() {
        let manifest = Manifest::parse(&generate_default_manifest("demo")).unwrap();
        assert_eq!(manifest.environment_name(), Some("demo"));
        assert!(manifest.is_empty());
    }
}
