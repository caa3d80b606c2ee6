//! Lockfile freshness.

use crate::core::manifest::Manifest;
use crate::resolver::encode::Lockfile;
use crate::util::hash::sha256_str;

/// Compute a hash of the manifest's resolution-affecting fields.
///
/// The hash covers package names, constraints and build options in name
/// order, so it is stable across formatting, comments and the choice
/// between `[dependencies]` and `[[package]]` entries.
pub fn compute_manifest_hash(manifest: &Manifest) -> String {
    let packages: Vec<serde_json::Value> = manifest
        .packages()
        .iter()
        .map(|spec| {
            serde_json::json!({
                "name": spec.name().as_str(),
                "constraint": spec.constraint().to_string(),
                "options": spec.options(),
            })
        })
        .collect();

    let normalized = serde_json::json!({ "packages": packages });
    sha256_str(&normalized.to_string())
}

/// Whether `lockfile` was resolved from a manifest equivalent to `manifest`.
pub fn is_fresh(lockfile: &Lockfile, manifest: &Manifest) -> bool {
    lockfile.manifest_hash() == Some(compute_manifest_hash(manifest).as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_ignores_formatting_and_form() {
        let a = Manifest::parse("[dependencies]\nfmt = \"^10.1\"\nzlib = \"1.3\"\n").unwrap();
        let b = Manifest::parse(concat!(
            "# comment\n[[package]]\nname = \"zlib\"\nversion = \"1.3\"\n\n",
            "[dependencies]\nfmt = \"^10.1\"\n",
        ))
        .unwrap();
        assert_eq!(compute_manifest_hash(&a), compute_manifest_hash(&b));
    }

    #[test]
    fn test_hash_tracks_constraints_and_options() {
        let base = Manifest::parse("[dependencies]\nfmt = \"^10.1\"\n").unwrap();
        let bumped = Manifest::parse("[dependencies]\nfmt = \"^10.2\"\n").unwrap();
        let optioned = Manifest::parse(
            "[dependencies]\nfmt = { version = \"^10.1\", options = { shared = \"on\" } }\n",
        )
        .unwrap();

        let h = compute_manifest_hash(&base);
        assert_ne!(h, compute_manifest_hash(&bumped));
        assert_ne!(h, compute_manifest_hash(&optioned));
    }

    #[test]
    fn test_freshness() {
        let m = Manifest::parse("[dependencies]\nfmt = \"^10.1\"\n").unwrap();
        let lockfile = Lockfile {
            version: crate::resolver::encode::LOCKFILE_VERSION,
            manifest_hash: None,
            packages: Vec::new(),
        };
        assert!(!is_fresh(&lockfile, &m));
        assert!(is_fresh(&lockfile.with_manifest_hash(compute_manifest_hash(&m)), &m));
    }
}
