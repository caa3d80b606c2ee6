//! End-to-end tests: an on-disk package index, `file://` mirrors, the real
//! fetcher and the environment registry.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use berth::util::hash::tree_digest;
use berth::{
    BuildDescription, Config, DirectoryIndex, EnvError, EnvironmentRegistry, Error, GlobalContext,
    Manifest, ResolveError, UrlFetcher,
};
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::TempDir;
use url::Url;

struct Workspace {
    tmp: TempDir,
}

impl Workspace {
    fn new() -> Self {
        Workspace {
            tmp: TempDir::new().unwrap(),
        }
    }

    fn path(&self) -> &Path {
        self.tmp.path()
    }

    /// Write an artifact tree and return (fingerprint, file URL).
    fn artifact(&self, dir: &str, files: &[(&str, &str)]) -> (String, String) {
        let root = self.path().join("mirror").join(dir);
        for (path, content) in files {
            let path = root.join(path);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        let fingerprint = tree_digest(&root).unwrap().to_string();
        (fingerprint, Url::from_file_path(&root).unwrap().to_string())
    }

    /// Publish `name` with (version, dependencies) entries, each backed by
    /// its own artifact holding `lib<name>.a` and a versioned header.
    fn publish(&self, name: &str, versions: &[(&str, &[(&str, &str)])]) {
        let mut index = String::new();
        for (version, deps) in versions {
            let header = format!("include/{}.h", name);
            let lib = format!("lib/lib{}.a", name.replace('-', "_"));
            let (fingerprint, url) = self.artifact(
                &format!("{}-{}", name, version),
                &[(header.as_str(), *version), (lib.as_str(), "archive")],
            );
            index.push_str(&format!(
                "[[version]]\nversion = \"{version}\"\n\
                 fingerprint = \"{fingerprint}\"\nurls = [\"{url}\"]\n"
            ));
            if !deps.is_empty() {
                index.push_str("[version.dependencies]\n");
                for (dep, constraint) in *deps {
                    index.push_str(&format!("{} = \"{}\"\n", dep, constraint));
                }
            }
            index.push('\n');
        }
        self.write_index(name, &index);
    }

    fn write_index(&self, name: &str, content: &str) {
        let path = self.index_root().join(&name[..1]).join(format!("{}.toml", name));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn index_root(&self) -> PathBuf {
        self.path().join("index")
    }

    fn registry(&self) -> EnvironmentRegistry {
        let context =
            GlobalContext::with_paths(self.path().to_path_buf(), self.path().join("home"));
        let config = Config::default();
        let fetcher = Arc::new(UrlFetcher::from_config(&config).unwrap());
        let index = Arc::new(DirectoryIndex::new(self.index_root()));
        EnvironmentRegistry::open(context, config, index, fetcher).unwrap()
    }
}

#[test]
fn test_highest_version_satisfying_every_dependant() {
    let ws = Workspace::new();
    ws.publish(
        "lib-a",
        &[("1.0.0", &[]), ("1.4.0", &[]), ("1.8.0", &[]), ("2.0.0", &[])],
    );
    ws.publish("lib-b", &[("1.0.0", &[("lib-a", ">=1.5")])]);

    let manifest = Manifest::parse(
        r#"
[environment]
name = "demo"

[dependencies]
lib-a = ">=1.0,<2.0"
lib-b = "*"
"#,
    )
    .unwrap();

    let registry = ws.registry();
    let env = registry.create("demo", &manifest).unwrap();

    let versions: Vec<_> = env
        .lockfile
        .packages
        .iter()
        .map(|p| format!("{} {}", p.name, p.version))
        .collect();
    assert_eq!(versions, ["lib-a 1.8.0", "lib-b 1.0.0"]);

    assert_eq!(
        fs::read_to_string(env.root.join("include/lib-a.h")).unwrap(),
        "1.8.0"
    );
    let description = BuildDescription::load(&env.root).unwrap();
    assert_eq!(description.link_libraries, ["lib_a", "lib_b"]);
    assert!(env.root.join("berth.cmake").is_file());
    assert!(env.root.join("activate.sh").is_file());
}

#[test]
fn test_conflicting_exact_constraints() {
    let ws = Workspace::new();
    ws.publish("lib-x", &[("1.0.0", &[]), ("2.0.0", &[])]);
    ws.publish("lib-y", &[("1.0.0", &[("lib-x", "==2.0")])]);

    let manifest = Manifest::parse("[dependencies]\nlib-x = \"==1.0\"\nlib-y = \"*\"\n").unwrap();
    let err = ws.registry().create("demo", &manifest).unwrap_err();

    match err {
        Error::Resolve(ResolveError::ResolutionConflict {
            package,
            constraints,
        }) => {
            assert_eq!(package, "lib-x");
            let mut rendered: Vec<_> = constraints.into_iter().map(|(_, c)| c).collect();
            rendered.sort();
            assert_eq!(rendered, ["==1.0", "==2.0"]);
        }
        other => panic!("expected a resolution conflict, got {other}"),
    }
}

#[test]
fn test_lifecycle_survives_restart() {
    let ws = Workspace::new();
    ws.publish("zlib", &[("1.3.1", &[])]);
    let manifest = Manifest::parse("[dependencies]\nzlib = \"^1.3\"\n").unwrap();

    let root = {
        let registry = ws.registry();
        registry.create("demo", &manifest).unwrap().root
    };

    let registry = ws.registry();
    let summaries = registry.list();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].name, "demo");
    assert_eq!(summaries[0].packages, 1);
    assert!(!registry.is_stale("demo", &manifest).unwrap());

    let lease = registry.lease("demo").unwrap();
    assert!(matches!(
        registry.destroy("demo"),
        Err(Error::Env(EnvError::EnvironmentBusy { .. }))
    ));
    assert!(root.join("include/zlib.h").exists());

    drop(lease);
    registry.destroy("demo").unwrap();
    assert!(!root.exists());
    assert!(matches!(
        registry.get("demo"),
        Err(Error::Env(EnvError::NotFound { .. }))
    ));
}

#[test]
fn test_tarball_mirror() {
    let ws = Workspace::new();

    // The fingerprint covers the tree after the wrapper directory is stripped.
    let (fingerprint, _) = ws.artifact(
        "expected/fmt",
        &[("include/fmt/core.h", "// fmt"), ("lib/libfmt.a", "fmt")],
    );

    let tarball = ws.path().join("fmt-10.1.1.tar.gz");
    let encoder = GzEncoder::new(fs::File::create(&tarball).unwrap(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder
        .append_dir_all("fmt-10.1.1", ws.path().join("mirror/expected/fmt"))
        .unwrap();
    builder.into_inner().unwrap().finish().unwrap();

    let url = Url::from_file_path(&tarball).unwrap();
    ws.write_index(
        "fmt",
        &format!(
            "[[version]]\nversion = \"10.1.1\"\n\
             fingerprint = \"{fingerprint}\"\nurls = [\"{url}\"]\n"
        ),
    );

    let manifest = Manifest::parse("[dependencies]\nfmt = \"^10\"\n").unwrap();
    let env = ws.registry().create("fmt-env", &manifest).unwrap();
    assert!(env.root.join("include/fmt/core.h").exists());
}
