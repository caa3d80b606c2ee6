//! Fetching artifacts from their declared mirrors.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use url::Url;

use crate::core::artifact::Artifact;
use crate::sources::archive::{extract_archive, ArchiveFormat};
use crate::sources::git::{GitMirror, GIT_PREFIX};
use crate::util::config::Config;
use crate::util::fs::{copy_dir_all, remove_dir_all_if_exists};

/// Writes the tree of an artifact into a directory.
///
/// Implementations only produce bytes; verification against the
/// fingerprint is the cache's job.
pub trait Fetcher: Send + Sync {
    /// Populate `dest` (an empty directory) with the artifact tree.
    fn fetch(&self, artifact: &Artifact, dest: &Path) -> Result<()>;
}

/// Default fetcher: tries each mirror URL in order.
///
/// `file://` URLs naming a directory are copied. Archives (`.tar`,
/// `.tar.gz`, `.tar.xz`, `.tar.bz2` and their short forms, `.zip`) are
/// downloaded (or read) and extracted. `git+` URLs are cloned.
pub struct UrlFetcher {
    client: reqwest::blocking::Client,
    offline: bool,
}

impl UrlFetcher {
    pub fn new(timeout: Duration, offline: bool) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("berth/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(UrlFetcher { client, offline })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.timeout(), config.net.offline)
    }

    fn fetch_one(&self, raw: &str, dest: &Path) -> Result<()> {
        if raw.starts_with(GIT_PREFIX) {
            let mirror = GitMirror::parse(raw)?;
            if self.offline && mirror.is_remote() {
                bail!("network access disabled (offline mode): {}", raw);
            }
            return mirror.checkout(dest);
        }

        let url = Url::parse(raw).with_context(|| format!("invalid mirror URL: {}", raw))?;
        let format = ArchiveFormat::detect(url.path());

        match url.scheme() {
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| anyhow!("invalid file URL: {}", raw))?;
                if path.is_dir() {
                    return copy_dir_all(&path, dest);
                }
                let Some(format) = format else {
                    bail!("unsupported artifact at {}", path.display());
                };
                let data = std::fs::read(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                extract_archive(format, &data, dest)
            }
            "http" | "https" => {
                if self.offline {
                    bail!("network access disabled (offline mode): {}", raw);
                }
                let Some(format) = format else {
                    bail!("unsupported artifact format: {}", raw);
                };
                tracing::info!("Downloading {}", raw);

                let response = self
                    .client
                    .get(url)
                    .send()
                    .with_context(|| format!("failed to download {}", raw))?;
                if !response.status().is_success() {
                    bail!("failed to download {}: HTTP {}", raw, response.status());
                }
                let bytes = response
                    .bytes()
                    .with_context(|| format!("failed to read response body from {}", raw))?;

                extract_archive(format, &bytes, dest)
            }
            other => bail!("unsupported URL scheme `{}`: {}", other, raw),
        }
    }
}

impl Fetcher for UrlFetcher {
    fn fetch(&self, artifact: &Artifact, dest: &Path) -> Result<()> {
        if artifact.urls.is_empty() {
            bail!("artifact {} declares no source URLs", artifact.fingerprint.short());
        }

        let mut last_error = None;
        for url in &artifact.urls {
            match self.fetch_one(url, dest) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!("Mirror {} failed: {:#}", url, e);
                    // Leave an empty directory for the next mirror.
                    remove_dir_all_if_exists(dest)?;
                    std::fs::create_dir_all(dest).with_context(|| {
                        format!("failed to recreate staging directory: {}", dest.display())
                    })?;
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| anyhow!("no mirror succeeded"))
            .context(format!(
                "all mirrors failed for artifact {}",
                artifact.fingerprint.short()
            )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::artifact::{ArtifactKind, Fingerprint};
    use crate::sources::archive::tests::{tarball, zipball};
    use tempfile::TempDir;

    fn artifact(urls: Vec<String>) -> Artifact {
        Artifact::new(
            Fingerprint::parse(&"0".repeat(64)).unwrap(),
            ArtifactKind::Binary,
            urls,
        )
    }

    fn fetcher(offline: bool) -> UrlFetcher {
        UrlFetcher::new(Duration::from_secs(5), offline).unwrap()
    }

    #[test]
    fn test_file_directory_is_copied() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("zlib");
        std::fs::create_dir_all(src.join("include")).unwrap();
        std::fs::write(src.join("include/zlib.h"), "// zlib").unwrap();

        let dest = tmp.path().join("dest");
        std::fs::create_dir_all(&dest).unwrap();
        let url = Url::from_file_path(&src).unwrap().to_string();

        fetcher(false).fetch(&artifact(vec![url]), &dest).unwrap();
        assert!(dest.join("include/zlib.h").is_file());
    }

    #[test]
    fn test_falls_back_to_next_mirror() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("fmt-10.1.0.tar.gz");
        std::fs::write(&archive, tarball(&[("fmt-10.1.0/include/fmt/core.h", "//")])).unwrap();

        let dest = tmp.path().join("dest");
        std::fs::create_dir_all(&dest).unwrap();
        let urls = vec![
            Url::from_file_path(tmp.path().join("missing.tar.gz"))
                .unwrap()
                .to_string(),
            Url::from_file_path(&archive).unwrap().to_string(),
        ];

        fetcher(false).fetch(&artifact(urls), &dest).unwrap();
        assert!(dest.join("include/fmt/core.h").is_file());
    }

    #[test]
    fn test_zip_mirror_is_extracted() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("sqlite-3.45.0.zip");
        std::fs::write(&archive, zipball(&[("sqlite-3.45.0/include/sqlite3.h", "//")])).unwrap();

        let dest = tmp.path().join("dest");
        std::fs::create_dir_all(&dest).unwrap();
        let url = Url::from_file_path(&archive).unwrap().to_string();

        fetcher(false).fetch(&artifact(vec![url]), &dest).unwrap();
        assert!(dest.join("include/sqlite3.h").is_file());
    }

    #[test]
    fn test_unknown_archive_format_fails() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("fmt.rar");
        std::fs::write(&archive, "rar").unwrap();
        let url = Url::from_file_path(&archive).unwrap().to_string();

        let err = fetcher(false)
            .fetch(&artifact(vec![url]), &tmp.path().join("dest"))
            .unwrap_err();
        assert!(format!("{:#}", err).contains("unsupported artifact"));
    }

    #[test]
    fn test_offline_refuses_remote_git() {
        let tmp = TempDir::new().unwrap();
        let err = fetcher(true)
            .fetch(
                &artifact(vec!["git+https://example.invalid/fmt.git#10.1.1".into()]),
                tmp.path(),
            )
            .unwrap_err();
        assert!(format!("{:#}", err).contains("offline"));
    }

    #[test]
    fn test_offline_refuses_http() {
        let tmp = TempDir::new().unwrap();
        let err = fetcher(true)
            .fetch(
                &artifact(vec!["https://example.invalid/a.tar.gz".into()]),
                tmp.path(),
            )
            .unwrap_err();
        assert!(format!("{:#}", err).contains("offline"));
    }

    #[test]
    fn test_no_urls_is_an_error() {
        let tmp = TempDir::new().unwrap();
        assert!(fetcher(false).fetch(&artifact(vec![]), tmp.path()).is_err());
    }
}
