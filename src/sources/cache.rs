//! Content-addressed artifact cache.
//!
//! Layout under the cache root:
//!
//! ```text
//! objects/<fingerprint>/   verified artifact trees
//! tmp/                     staging directories for in-flight fetches
//! index.json               size, last access and owners per fingerprint
//! ```
//!
//! An object directory only appears through a rename of a fully fetched and
//! verified staging directory, so readers never observe a partial artifact.
//! Fetches of the same fingerprint are serialized by a keyed lock; the
//! second caller finds the object the first one produced.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use thiserror::Error;

use crate::core::artifact::{Artifact, Fingerprint};
use crate::sources::fetch::Fetcher;
use crate::util::config::Config;
use crate::util::fs::{dir_size, ensure_dir, remove_dir_all_if_exists, write_atomic};
use crate::util::hash::tree_digest;
use crate::util::lock::{CancelToken, KeyedLocks};

const OBJECTS_DIR: &str = "objects";
const TMP_DIR: &str = "tmp";
const INDEX_FILE: &str = "index.json";
const INDEX_VERSION: u32 = 1;

/// Errors surfaced by the artifact cache.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum CacheError {
    /// Fetched or cached content does not hash to its fingerprint.
    #[error("artifact {fingerprint} failed verification: content hashes to {actual}")]
    #[diagnostic(code(berth::cache::integrity))]
    IntegrityFailure { fingerprint: String, actual: String },

    #[error("failed to fetch artifact {fingerprint} after {attempts} attempt(s): {message}")]
    #[diagnostic(
        code(berth::cache::fetch_failed),
        help("check the artifact's mirror URLs and network access")
    )]
    FetchFailed {
        fingerprint: String,
        attempts: u32,
        message: String,
    },

    #[error("acquisition of artifact {fingerprint} was cancelled")]
    #[diagnostic(code(berth::cache::cancelled))]
    Cancelled { fingerprint: String },

    #[error("cache I/O error: {message}")]
    #[diagnostic(code(berth::cache::io))]
    Io { message: String },
}

impl CacheError {
    fn io(err: anyhow::Error) -> Self {
        CacheError::Io {
            message: format!("{:#}", err),
        }
    }
}

/// A cached artifact, as reported by [`ArtifactCache::entries`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub path: PathBuf,
    pub size: u64,
    pub last_access: SystemTime,
    /// Environments holding a reference to this artifact.
    pub owners: BTreeSet<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndex {
    version: u32,
    /// Logical clock; orders accesses that share a timestamp.
    #[serde(default)]
    clock: u64,
    #[serde(default)]
    entries: BTreeMap<Fingerprint, IndexRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct IndexRecord {
    size: u64,
    /// Milliseconds since the Unix epoch.
    last_access: u64,
    #[serde(default)]
    serial: u64,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    owners: BTreeSet<String>,
}

impl CacheIndex {
    fn touch(&mut self, fingerprint: &Fingerprint) -> &mut IndexRecord {
        self.clock += 1;
        let serial = self.clock;
        let record = self.entries.entry(fingerprint.clone()).or_default();
        record.last_access = now_millis();
        record.serial = serial;
        record
    }

    fn total_size(&self) -> u64 {
        self.entries.values().map(|r| r.size).sum()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The content-addressed artifact store.
pub struct ArtifactCache {
    root: PathBuf,
    fetcher: Arc<dyn Fetcher>,
    max_size: Option<u64>,
    max_attempts: u32,
    locks: KeyedLocks<Fingerprint>,
    index: Mutex<CacheIndex>,
}

impl ArtifactCache {
    /// Open (or create) a cache rooted at `root`.
    pub fn open(
        root: impl Into<PathBuf>,
        fetcher: Arc<dyn Fetcher>,
        config: &Config,
    ) -> Result<Self, CacheError> {
        let root = root.into();
        ensure_dir(&root.join(OBJECTS_DIR)).map_err(CacheError::io)?;
        ensure_dir(&root.join(TMP_DIR)).map_err(CacheError::io)?;

        let cache = ArtifactCache {
            index: Mutex::new(load_index(&root)),
            root,
            fetcher,
            max_size: config.cache.max_size,
            max_attempts: config.max_attempts(),
            locks: KeyedLocks::new(),
        };
        cache.reconcile()?;
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Size ceiling in bytes, if any.
    pub fn max_size(&self) -> Option<u64> {
        self.max_size
    }

    /// Where the tree for `fingerprint` lives (or would live).
    pub fn object_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root.join(OBJECTS_DIR).join(fingerprint.as_str())
    }

    fn index(&self) -> MutexGuard<'_, CacheIndex> {
        // Records are replaced whole, so a poisoned index is still usable.
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, index: &CacheIndex) -> Result<(), CacheError> {
        let data = serde_json::to_vec_pretty(index)
            .context("failed to serialize cache index")
            .map_err(CacheError::io)?;
        write_atomic(&self.root.join(INDEX_FILE), &data).map_err(CacheError::io)
    }

    /// Bring the index in line with the objects directory.
    fn reconcile(&self) -> Result<(), CacheError> {
        let objects = self.root.join(OBJECTS_DIR);
        let mut present = BTreeSet::new();

        let dir = std::fs::read_dir(&objects)
            .with_context(|| format!("failed to read {}", objects.display()))
            .map_err(CacheError::io)?;
        for entry in dir {
            let entry = entry
                .context("failed to read cache object entry")
                .map_err(CacheError::io)?;
            let name = entry.file_name();
            match Fingerprint::parse(&name.to_string_lossy()) {
                Ok(fp) if entry.path().is_dir() => {
                    present.insert(fp);
                }
                _ => tracing::debug!("Ignoring stray cache entry {:?}", name),
            }
        }

        let mut index = self.index();
        let mut changed = false;
        for fp in &present {
            if !index.entries.contains_key(fp) {
                let size = dir_size(&self.object_path(fp)).map_err(CacheError::io)?;
                index.touch(fp).size = size;
                changed = true;
            }
        }
        let before = index.entries.len();
        index
            .entries
            .retain(|fp, record| present.contains(fp) || !record.owners.is_empty());
        changed |= index.entries.len() != before;

        if changed {
            self.persist(&index)?;
        }
        Ok(())
    }

    /// Path of a cached artifact, without verifying or fetching it.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<PathBuf> {
        let path = self.object_path(fingerprint);
        path.is_dir().then_some(path)
    }

    /// Recompute the digest of a cached artifact.
    pub fn verify(&self, fingerprint: &Fingerprint) -> Result<PathBuf, CacheError> {
        let path = self.object_path(fingerprint);
        let actual = tree_digest(&path).map_err(CacheError::io)?;
        if actual != *fingerprint {
            return Err(CacheError::IntegrityFailure {
                fingerprint: fingerprint.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(path)
    }

    /// Return a verified local path for `artifact`, fetching it if needed.
    pub fn acquire(&self, artifact: &Artifact) -> Result<PathBuf, CacheError> {
        self.acquire_with(artifact, &CancelToken::new())
    }

    /// Like [`acquire`](Self::acquire), checking `cancel` between steps.
    pub fn acquire_with(
        &self,
        artifact: &Artifact,
        cancel: &CancelToken,
    ) -> Result<PathBuf, CacheError> {
        let fingerprint = &artifact.fingerprint;
        let cancelled = || CacheError::Cancelled {
            fingerprint: fingerprint.to_string(),
        };

        let _guard = self.locks.lock(fingerprint);
        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        if self.lookup(fingerprint).is_some() {
            match self.verify(fingerprint) {
                Ok(path) => {
                    tracing::debug!("Cache hit for {}", fingerprint.short());
                    let mut index = self.index();
                    index.touch(fingerprint);
                    self.persist(&index)?;
                    return Ok(path);
                }
                Err(e) => {
                    tracing::warn!("{}; evicting and fetching again", e);
                    remove_dir_all_if_exists(&self.object_path(fingerprint))
                        .map_err(CacheError::io)?;
                }
            }
        }

        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return Err(cancelled());
            }

            match self.stage(artifact) {
                Ok((staging, size)) => {
                    if cancel.is_cancelled() {
                        return Err(cancelled());
                    }
                    let path = self.object_path(fingerprint);
                    std::fs::rename(staging.path(), &path)
                        .with_context(|| format!("failed to move artifact into {}", path.display()))
                        .map_err(CacheError::io)?;

                    {
                        let mut index = self.index();
                        index.touch(fingerprint).size = size;
                        self.persist(&index)?;
                    }
                    tracing::info!("Cached artifact {} ({} bytes)", fingerprint.short(), size);

                    if let Some(ceiling) = self.max_size {
                        self.evict_to_fit(ceiling)?;
                    }
                    return Ok(path);
                }
                Err(e) => {
                    tracing::warn!(
                        "Attempt {}/{} for artifact {} failed: {:#}",
                        attempt,
                        self.max_attempts,
                        fingerprint.short(),
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(CacheError::FetchFailed {
            fingerprint: fingerprint.to_string(),
            attempts: self.max_attempts,
            message: last_error
                .map(|e| format!("{:#}", e))
                .unwrap_or_else(|| "no attempt was made".to_string()),
        })
    }

    /// Fetch into a fresh staging directory and verify the result.
    fn stage(&self, artifact: &Artifact) -> anyhow::Result<(TempDir, u64)> {
        let fingerprint = &artifact.fingerprint;
        let staging = tempfile::Builder::new()
            .prefix(&format!("{}-", fingerprint.short()))
            .tempdir_in(self.root.join(TMP_DIR))
            .context("failed to create staging directory")?;

        tracing::info!("Fetching artifact {}", fingerprint.short());
        self.fetcher.fetch(artifact, staging.path())?;

        let actual = tree_digest(staging.path())?;
        if actual != *fingerprint {
            return Err(CacheError::IntegrityFailure {
                fingerprint: fingerprint.to_string(),
                actual: actual.to_string(),
            }
            .into());
        }

        let size = dir_size(staging.path())?;
        Ok((staging, size))
    }

    /// Record `owner` as holding each of `fingerprints`.
    ///
    /// Fingerprints not yet cached get a placeholder record, so an owner can
    /// pin artifacts before acquiring them.
    pub fn add_refs<'a>(
        &self,
        owner: &str,
        fingerprints: impl IntoIterator<Item = &'a Fingerprint>,
    ) -> Result<(), CacheError> {
        let mut index = self.index();
        for fp in fingerprints {
            index
                .entries
                .entry(fp.clone())
                .or_default()
                .owners
                .insert(owner.to_string());
        }
        self.persist(&index)
    }

    /// Drop every reference held by `owner`.
    pub fn release_owner(&self, owner: &str) -> Result<(), CacheError> {
        let mut index = self.index();
        for record in index.entries.values_mut() {
            record.owners.remove(owner);
        }
        let objects = self.root.join(OBJECTS_DIR);
        index
            .entries
            .retain(|fp, record| !record.owners.is_empty() || objects.join(fp.as_str()).is_dir());
        self.persist(&index)
    }

    /// All cached artifacts, ordered by fingerprint.
    pub fn entries(&self) -> Vec<CacheEntry> {
        let index = self.index();
        index
            .entries
            .iter()
            .filter_map(|(fp, record)| {
                let path = self.lookup(fp)?;
                Some(CacheEntry {
                    fingerprint: fp.clone(),
                    path,
                    size: record.size,
                    last_access: UNIX_EPOCH + Duration::from_millis(record.last_access),
                    owners: record.owners.clone(),
                })
            })
            .collect()
    }

    /// Total recorded size of cached artifacts, in bytes.
    pub fn total_size(&self) -> u64 {
        self.index().total_size()
    }

    /// Evict least recently used, unreferenced artifacts until the total
    /// size is at most `ceiling`. Returns the evicted fingerprints.
    ///
    /// Entries with owners, or whose lock is held by an in-flight
    /// acquisition, are never removed.
    pub fn evict_to_fit(&self, ceiling: u64) -> Result<Vec<Fingerprint>, CacheError> {
        let mut index = self.index();
        let mut total = index.total_size();
        if total <= ceiling {
            return Ok(Vec::new());
        }

        let mut candidates: Vec<_> = index
            .entries
            .iter()
            .filter(|(_, record)| record.owners.is_empty())
            .map(|(fp, record)| (record.last_access, record.serial, fp.clone()))
            .collect();
        candidates.sort();

        let mut evicted = Vec::new();
        for (_, _, fp) in candidates {
            if total <= ceiling {
                break;
            }
            let Some(_guard) = self.locks.try_lock(&fp) else {
                tracing::debug!("Skipping in-use artifact {}", fp.short());
                continue;
            };
            remove_dir_all_if_exists(&self.object_path(&fp)).map_err(CacheError::io)?;
            if let Some(record) = index.entries.remove(&fp) {
                total = total.saturating_sub(record.size);
            }
            tracing::debug!("Evicted artifact {}", fp.short());
            evicted.push(fp);
        }

        if total > ceiling {
            tracing::warn!(
                "Cache is {} bytes, above its {} byte ceiling; remaining artifacts are in use",
                total,
                ceiling
            );
        }

        if !evicted.is_empty() {
            self.persist(&index)?;
        }
        Ok(evicted)
    }

    /// Remove every artifact no environment references.
    pub fn prune_unreferenced(&self) -> Result<Vec<Fingerprint>, CacheError> {
        self.evict_to_fit(0)
    }
}

fn load_index(root: &Path) -> CacheIndex {
    let path = root.join(INDEX_FILE);
    let fresh = || CacheIndex {
        version: INDEX_VERSION,
        ..CacheIndex::default()
    };

    let data = match std::fs::read(&path) {
        Ok(data) => data,
        Err(_) => return fresh(),
    };
    match serde_json::from_slice::<CacheIndex>(&data) {
        Ok(index) if index.version == INDEX_VERSION => index,
        Ok(index) => {
            tracing::warn!(
                "Cache index version {} is not supported; rebuilding",
                index.version
            );
            fresh()
        }
        Err(e) => {
            tracing::warn!("Cache index at {} is unreadable ({}); rebuilding", path.display(), e);
            fresh()
        }
    }
}
