//! Environment layout: placing artifact files into an environment root.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::builder::BuildError;
use crate::core::artifact::Fingerprint;
use crate::util::fs::{copy_dir_all, same_contents, symlink};

/// Artifact subtrees merged into the environment root.
pub const SUBTREES: [&str; 4] = ["include", "lib", "bin", "share"];

/// Directory exposing whole source artifacts.
pub const SRC_DIR: &str = "src";

/// How artifact files are placed into an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaterializeMode {
    /// Link to the file in the cache
    Symlink,
    /// Copy the file out of the cache
    Copy,
}

impl Default for MaterializeMode {
    fn default() -> Self {
        if cfg!(unix) {
            MaterializeMode::Symlink
        } else {
            MaterializeMode::Copy
        }
    }
}

/// One cached artifact being installed.
#[derive(Debug, Clone, Copy)]
pub struct InstallSource<'a> {
    /// Display name of the owning package, e.g. `zlib v1.3.1`
    pub package: &'a str,
    pub fingerprint: &'a Fingerprint,
    /// Artifact tree in the cache
    pub root: &'a Path,
}

/// Installs artifact trees into a staging root, tracking which package put
/// each file there.
pub struct Installer {
    root: PathBuf,
    mode: MaterializeMode,
    claims: BTreeMap<PathBuf, String>,
}

impl Installer {
    pub fn new(root: impl Into<PathBuf>, mode: MaterializeMode) -> Self {
        Installer {
            root: root.into(),
            mode,
            claims: BTreeMap::new(),
        }
    }

    /// Install the layout subtrees of `source`.
    pub fn install(&mut self, source: InstallSource<'_>) -> Result<(), BuildError> {
        if !source.root.is_dir() {
            return Err(missing(&source));
        }
        for subtree in SUBTREES {
            self.install_subtree(&source, subtree)?;
        }
        Ok(())
    }

    /// Expose the whole artifact tree under `src/<dir_name>`.
    pub fn install_source_tree(
        &mut self,
        source: InstallSource<'_>,
        dir_name: &str,
    ) -> Result<(), BuildError> {
        if !source.root.is_dir() {
            return Err(missing(&source));
        }
        let rel = Path::new(SRC_DIR).join(dir_name);
        let dest = self.root.join(&rel);
        fs::create_dir_all(self.root.join(SRC_DIR)).map_err(|e| io_error(&source, e, &dest))?;
        crate::util::fs::remove_dir_all_if_exists(&dest).map_err(|e| BuildError::Io {
            message: format!("{:#}", e),
        })?;

        match self.mode {
            MaterializeMode::Symlink => {
                symlink(source.root, &dest).map_err(|e| io_error(&source, e, &dest))?
            }
            MaterializeMode::Copy => copy_dir_all(source.root, &dest).map_err(|e| {
                if source.root.exists() {
                    BuildError::Io {
                        message: format!("{:#}", e),
                    }
                } else {
                    missing(&source)
                }
            })?,
        }
        self.claims.insert(rel, source.package.to_string());
        Ok(())
    }

    fn install_subtree(
        &mut self,
        source: &InstallSource<'_>,
        subtree: &str,
    ) -> Result<(), BuildError> {
        let src_dir = source.root.join(subtree);
        if !src_dir.is_dir() {
            return Ok(());
        }

        for entry in WalkDir::new(&src_dir).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                if source.root.exists() {
                    BuildError::Io {
                        message: format!("failed to walk {}: {}", src_dir.display(), e),
                    }
                } else {
                    missing(source)
                }
            })?;

            let rel = entry
                .path()
                .strip_prefix(source.root)
                .map_err(|e| BuildError::Io {
                    message: e.to_string(),
                })?
                .to_path_buf();
            let dest = self.root.join(&rel);

            if entry.file_type().is_dir() {
                if fs::symlink_metadata(&dest).is_ok_and(|m| !m.is_dir()) {
                    return Err(self.conflict(rel, source));
                }
                fs::create_dir_all(&dest).map_err(|e| io_error(source, e, &dest))?;
                continue;
            }

            self.place(source, entry.path(), rel, entry.path_is_symlink())?;
        }
        Ok(())
    }

    fn place(
        &mut self,
        source: &InstallSource<'_>,
        src: &Path,
        rel: PathBuf,
        is_link: bool,
    ) -> Result<(), BuildError> {
        let dest = self.root.join(&rel);

        if fs::symlink_metadata(&dest).is_ok() {
            let ours = self.claims.get(&rel).map(String::as_str) == Some(source.package);
            if ours {
                // Left behind by an interrupted attempt for this package.
                fs::remove_file(&dest).map_err(|e| io_error(source, e, &dest))?;
            } else if same_contents(src, &dest).unwrap_or(false) {
                tracing::debug!("Skipping identical file {}", rel.display());
                return Ok(());
            } else {
                return Err(self.conflict(rel, source));
            }
        }

        match self.mode {
            MaterializeMode::Symlink => symlink(src, &dest),
            MaterializeMode::Copy if is_link => {
                fs::read_link(src).and_then(|target| symlink(&target, &dest))
            }
            MaterializeMode::Copy => fs::copy(src, &dest).map(|_| ()),
        }
        .map_err(|e| io_error(source, e, &dest))?;

        self.claims.insert(rel, source.package.to_string());
        Ok(())
    }

    fn conflict(&self, rel: PathBuf, source: &InstallSource<'_>) -> BuildError {
        let first = self
            .claims
            .get(&rel)
            .cloned()
            .unwrap_or_else(|| "an earlier package".to_string());
        BuildError::LayoutConflict {
            path: rel,
            first,
            second: source.package.to_string(),
        }
    }
}

fn missing(source: &InstallSource<'_>) -> BuildError {
    BuildError::ArtifactMissing {
        package: source.package.to_string(),
        fingerprint: source.fingerprint.to_string(),
        path: source.root.to_path_buf(),
    }
}

/// A vanished artifact root turns any I/O failure into `ArtifactMissing`.
fn io_error(source: &InstallSource<'_>, err: io::Error, dest: &Path) -> BuildError {
    if source.root.exists() {
        BuildError::Io {
            message: format!("failed to install {}: {}", dest.display(), err),
        }
    } else {
        missing(source)
    }
}

/// Link names provided by the libraries in `lib_dir`, sorted.
///
/// `libfoo.a`, `libfoo.so`, `libfoo.dylib` and `foo.lib` all provide `foo`.
pub fn derive_links(lib_dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(lib_dir) else {
        return Vec::new();
    };

    let mut names = BTreeSet::new();
    for entry in entries.flatten() {
        if let Some(name) = link_name(&entry.file_name().to_string_lossy()) {
            names.insert(name);
        }
    }
    names.into_iter().collect()
}

fn link_name(file: &str) -> Option<String> {
    if let Some(stem) = file.strip_prefix("lib") {
        for ext in [".a", ".so", ".dylib"] {
            if let Some(name) = stem.strip_suffix(ext) {
                return (!name.is_empty()).then(|| name.to_string());
            }
        }
    }
    file.strip_suffix(".lib")
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}
