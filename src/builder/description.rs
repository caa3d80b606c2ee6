//! Generated build descriptions.
//!
//! Every environment carries three views of the same information for
//! external build systems:
//! - `berth.json` - machine-readable description
//! - `berth.cmake` - a fragment to `include()` from a CMakeLists.txt
//! - `activate.sh` - a script to source into a POSIX shell
//!
//! None of them contain timestamps, so regenerating them from the same
//! lockfile yields the same bytes.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::artifact::{ArtifactKind, Fingerprint};
use crate::util::fs::write_atomic;

pub const DESCRIPTION_FILE: &str = "berth.json";
pub const CMAKE_FILE: &str = "berth.cmake";
pub const ACTIVATE_FILE: &str = "activate.sh";

/// Description of a materialized environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDescription {
    pub environment: String,
    pub root: PathBuf,
    pub include_dirs: Vec<PathBuf>,
    pub library_dirs: Vec<PathBuf>,
    pub bin_dirs: Vec<PathBuf>,
    /// Link names, dependencies before dependants
    pub link_libraries: Vec<String>,
    pub packages: Vec<PackageDescription>,
}

/// One package in a [`BuildDescription`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDescription {
    pub name: String,
    pub version: String,
    pub fingerprint: Fingerprint,
    pub kind: ArtifactKind,
    pub links: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
    /// Where a source artifact is exposed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_dir: Option<PathBuf>,
}

impl BuildDescription {
    /// Read `berth.json` from an environment root.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(DESCRIPTION_FILE);
        let data = std::fs::read(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_slice(&data).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Write all three description files into `dir`.
    ///
    /// `dir` may be a staging directory; paths inside the files refer to
    /// `self.root`.
    pub fn write_all(&self, dir: &Path) -> Result<()> {
        let mut json = serde_json::to_string_pretty(self)
            .context("failed to serialize build description")?;
        json.push('\n');
        write_atomic(&dir.join(DESCRIPTION_FILE), json.as_bytes())?;
        write_atomic(&dir.join(CMAKE_FILE), self.to_cmake().as_bytes())?;
        write_atomic(&dir.join(ACTIVATE_FILE), self.to_activate_script().as_bytes())?;
        Ok(())
    }

    /// Render the CMake fragment.
    pub fn to_cmake(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Generated by berth for environment `{}`.", self.environment);
        let _ = writeln!(out, "# Do not edit; rerun berth to regenerate.\n");
        let _ = writeln!(out, "set(BERTH_ENV_NAME \"{}\")", self.environment);
        let _ = writeln!(out, "set(BERTH_ENV_ROOT \"{}\")", cmake_path(&self.root));
        let _ = writeln!(out, "list(PREPEND CMAKE_PREFIX_PATH \"${{BERTH_ENV_ROOT}}\")");
        let _ = writeln!(out, "set(BERTH_INCLUDE_DIRS {})", cmake_list(&self.include_dirs));
        let _ = writeln!(out, "set(BERTH_LIBRARY_DIRS {})", cmake_list(&self.library_dirs));
        let _ = writeln!(
            out,
            "set(BERTH_LINK_LIBRARIES {})",
            self.link_libraries
                .iter()
                .map(|l| format!("\"{}\"", l))
                .collect::<Vec<_>>()
                .join(" ")
        );
        out.push_str(
            "\nif(NOT TARGET berth::env)\n\
             \x20 add_library(berth::env INTERFACE IMPORTED)\n\
             \x20 set_target_properties(berth::env PROPERTIES\n\
             \x20   INTERFACE_INCLUDE_DIRECTORIES \"${BERTH_INCLUDE_DIRS}\"\n\
             \x20   INTERFACE_LINK_DIRECTORIES \"${BERTH_LIBRARY_DIRS}\"\n\
             \x20   INTERFACE_LINK_LIBRARIES \"${BERTH_LINK_LIBRARIES}\")\n\
             endif()\n",
        );
        out
    }

    /// Render the shell activation script.
    pub fn to_activate_script(&self) -> String {
        let root = shell_quote(&self.root.display().to_string());
        let mut out = String::new();
        let _ = writeln!(out, "# Generated by berth for environment `{}`.", self.environment);
        let _ = writeln!(out, "# Source this file from a POSIX shell: . ./activate.sh\n");
        let _ = writeln!(out, "export BERTH_ENV={}", shell_quote(&self.environment));
        let _ = writeln!(out, "export BERTH_ENV_ROOT={}", root);
        for (var, sub) in [
            ("PATH", "bin"),
            ("CPATH", "include"),
            ("LIBRARY_PATH", "lib"),
            ("LD_LIBRARY_PATH", "lib"),
            ("PKG_CONFIG_PATH", "lib/pkgconfig"),
        ] {
            let _ = writeln!(
                out,
                "export {var}=\"$BERTH_ENV_ROOT/{sub}${{{var}:+:${var}}}\""
            );
        }
        out
    }
}

fn cmake_path(path: &Path) -> String {
    path.display().to_string().replace('\\', "/")
}

fn cmake_list(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| format!("\"{}\"", cmake_path(p)))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn description() -> BuildDescription {
        let root = PathBuf::from("/envs/demo");
        BuildDescription {
            environment: "demo".to_string(),
            include_dirs: vec![root.join("include")],
            library_dirs: vec![root.join("lib")],
            bin_dirs: vec![],
            link_libraries: vec!["z".to_string(), "png".to_string()],
            packages: vec![PackageDescription {
                name: "zlib".to_string(),
                version: "1.3.1".to_string(),
                fingerprint: Fingerprint::parse(&"b".repeat(64)).unwrap(),
                kind: ArtifactKind::Binary,
                links: vec!["z".to_string()],
                options: BTreeMap::new(),
                source_dir: None,
            }],
            root,
        }
    }

    #[test]
    fn test_cmake_fragment() {
        let cmake = description().to_cmake();
        assert!(cmake.contains("set(BERTH_ENV_ROOT \"/envs/demo\")"));
        assert!(cmake.contains("set(BERTH_LINK_LIBRARIES \"z\" \"png\")"));
        assert!(cmake.contains("add_library(berth::env INTERFACE IMPORTED)"));
    }

    #[test]
    fn test_activate_script() {
        let script = description().to_activate_script();
        assert!(script.contains("export BERTH_ENV_ROOT='/envs/demo'"));
        assert!(script.contains("export PATH=\"$BERTH_ENV_ROOT/bin${PATH:+:$PATH}\""));
    }

    #[test]
    fn test_write_and_load() {
        let tmp = TempDir::new().unwrap();
        let desc = description();
        desc.write_all(tmp.path()).unwrap();

        assert!(tmp.path().join(CMAKE_FILE).is_file());
        assert!(tmp.path().join(ACTIVATE_FILE).is_file());
        assert_eq!(BuildDescription::load(tmp.path()).unwrap(), desc);
    }

    #[test]
    fn test_shell_quote_escapes() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }
}
