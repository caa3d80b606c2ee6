//! Test fixtures: packages, manifests and on-disk artifact trees.

use std::path::Path;

use semver::Version;
use url::Url;

use crate::core::artifact::{Artifact, ArtifactKind, Fingerprint};
use crate::core::constraint::VersionConstraint;
use crate::core::dependency::Dependency;
use crate::core::manifest::{Manifest, PackageSpec};
use crate::core::name::PackageName;
use crate::core::package_version::PackageVersion;
use crate::util::hash::{sha256_str, tree_digest};

fn name(s: &str) -> PackageName {
    PackageName::new(s).unwrap()
}

fn deps(deps: &[(&str, &str)]) -> Vec<Dependency> {
    deps.iter()
        .map(|(n, c)| Dependency::new(name(n), VersionConstraint::parse(c).unwrap()))
        .collect()
}

/// A package version with a placeholder artifact.
pub fn pkg(pkg_name: &str, version: &str, dependencies: &[(&str, &str)]) -> PackageVersion {
    let fingerprint =
        Fingerprint::parse(&sha256_str(&format!("{}-{}", pkg_name, version))).unwrap();
    PackageVersion::new(
        name(pkg_name),
        Version::parse(version).unwrap(),
        deps(dependencies),
        Artifact::new(fingerprint, ArtifactKind::Binary, Vec::new()),
    )
}

/// A package version backed by a real artifact.
pub fn pkg_with_artifact(
    pkg_name: &str,
    version: &str,
    dependencies: &[(&str, &str)],
    artifact: Artifact,
) -> PackageVersion {
    PackageVersion::new(
        name(pkg_name),
        Version::parse(version).unwrap(),
        deps(dependencies),
        artifact,
    )
}

/// A manifest from (name, constraint) pairs.
pub fn manifest(entries: &[(&str, &str)]) -> Manifest {
    let specs = entries
        .iter()
        .map(|(n, c)| {
            PackageSpec::new(
                name(n),
                VersionConstraint::parse(c).unwrap(),
                Default::default(),
            )
        })
        .collect();
    Manifest::from_specs(specs).unwrap()
}

/// Write a binary artifact tree under `<root>/artifacts/<dir>` and
/// describe it with its real fingerprint and a `file://` mirror.
pub fn artifact_tree(root: &Path, dir: &str, files: &[(&str, &str)]) -> Artifact {
    write_artifact(root, dir, files, ArtifactKind::Binary)
}

/// Like [`artifact_tree`], for a source artifact.
pub fn source_tree(root: &Path, dir: &str, files: &[(&str, &str)]) -> Artifact {
    write_artifact(root, dir, files, ArtifactKind::Source)
}

fn write_artifact(root: &Path, dir: &str, files: &[(&str, &str)], kind: ArtifactKind) -> Artifact {
    let tree = root.join("artifacts").join(dir);
    for (path, content) in files {
        let path = tree.join(path);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
    std::fs::create_dir_all(&tree).unwrap();

    let fingerprint = tree_digest(&tree).unwrap();
    let url = Url::from_file_path(&tree).unwrap().to_string();
    Artifact::new(fingerprint, kind, vec![url])
}
