//! Hashing utilities for checksums and artifact fingerprints.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::core::artifact::Fingerprint;

/// Compute SHA256 hash of a byte slice.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute SHA256 hash of a string.
pub fn sha256_str(s: &str) -> String {
    sha256_bytes(s.as_bytes())
}

/// Compute SHA256 hash of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("failed to open file for hashing: {}", path.display()))?;

    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// A hasher for building digests from multiple components.
#[derive(Default)]
pub struct DigestBuilder {
    hasher: Sha256,
}

impl DigestBuilder {
    pub fn new() -> Self {
        DigestBuilder {
            hasher: Sha256::new(),
        }
    }

    /// Add a string component.
    pub fn update_str(&mut self, s: &str) -> &mut Self {
        self.hasher.update(s.as_bytes());
        self.hasher.update(b"\0"); // Separator
        self
    }

    /// Finalize and return the digest as a hex string.
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Compute the fingerprint of an artifact tree.
///
/// Entries are visited in sorted order. Each contributes its kind, its
/// `/`-separated path relative to `root`, and its content hash (files) or
/// link target (symlinks). Timestamps and permissions are not hashed.
pub fn tree_digest(root: &Path) -> Result<Fingerprint> {
    let mut digest = DigestBuilder::new();

    for entry in WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("{} escapes {}", entry.path().display(), root.display()))?;
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let ty = entry.file_type();
        if ty.is_symlink() {
            let target = std::fs::read_link(entry.path())
                .with_context(|| format!("failed to read link {}", entry.path().display()))?;
            digest
                .update_str("l")
                .update_str(&rel)
                .update_str(&target.to_string_lossy());
        } else if ty.is_dir() {
            digest.update_str("d").update_str(&rel);
        } else {
            let hash = sha256_file(entry.path())?;
            digest.update_str("f").update_str(&rel).update_str(&hash);
        }
    }

    Fingerprint::parse(&digest.finish()).context("digest produced a malformed fingerprint")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sha256_str() {
        let hash = sha256_str("hello");
        assert_eq!(
            hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_sha256_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("test.txt");
        std::fs::write(&path, "hello").unwrap();

        let hash = sha256_file(&path).unwrap();
        assert_eq!(
            hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_tree_digest_is_location_independent() {
        let tmp = TempDir::new().unwrap();
        for dir in ["a", "b"] {
            let include = tmp.path().join(dir).join("include");
            std::fs::create_dir_all(&include).unwrap();
            std::fs::write(include.join("zlib.h"), "#define ZLIB 1\n").unwrap();
        }

        let a = tree_digest(&tmp.path().join("a")).unwrap();
        let b = tree_digest(&tmp.path().join("b")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_tree_digest_sees_content_and_names() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("pkg");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("a.h"), "one").unwrap();
        let before = tree_digest(&root).unwrap();

        std::fs::write(root.join("a.h"), "two").unwrap();
        let edited = tree_digest(&root).unwrap();
        assert_ne!(before, edited);

        std::fs::rename(root.join("a.h"), root.join("b.h")).unwrap();
        let renamed = tree_digest(&root).unwrap();
        assert_ne!(edited, renamed);
    }
}
