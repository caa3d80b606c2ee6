//! Test utilities for berth unit tests.
//!
//! Fixtures build packages, manifests and real artifact trees; the
//! [`CountingFetcher`] stands in for the network and records how often it
//! was asked to fetch.

pub mod fixtures;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use url::Url;

use crate::core::artifact::Artifact;
use crate::sources::fetch::Fetcher;
use crate::util::fs::copy_dir_all;

pub use fixtures::*;

/// A fetcher that copies `file://` directory mirrors and counts calls.
#[derive(Debug, Default)]
pub struct CountingFetcher {
    count: AtomicUsize,
    corrupt: AtomicUsize,
    delay: Duration,
}

impl CountingFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every fetch, to widen race windows.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make the next `n` fetches produce content that fails verification.
    pub fn corrupt_next(&self, n: usize) {
        self.corrupt.store(n, Ordering::SeqCst);
    }

    /// Number of fetches performed.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl Fetcher for CountingFetcher {
    fn fetch(&self, artifact: &Artifact, dest: &Path) -> Result<()> {
        self.count.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let url = artifact
            .urls
            .first()
            .ok_or_else(|| anyhow!("artifact has no mirror"))?;
        let src = Url::parse(url)?
            .to_file_path()
            .map_err(|_| anyhow!("not a file URL: {}", url))?;
        copy_dir_all(&src, dest).context("fixture copy failed")?;

        let corrupt = self
            .corrupt
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if corrupt {
            std::fs::write(dest.join("garbage"), "not part of the artifact")?;
        }
        Ok(())
    }
}
