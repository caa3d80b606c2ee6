//! The environment registry.
//!
//! Maps environment names to their roots and keeps that mapping in
//! `<home>/environments.toml`. Operations on one name are serialized by a
//! per-name lock; different names proceed in parallel.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::builder::EnvironmentBuilder;
use crate::core::artifact::Fingerprint;
use crate::core::manifest::Manifest;
use crate::error::Result;
use crate::ops::lockfile::{compute_manifest_hash, is_fresh};
use crate::resolver::encode::{Lockfile, LOCKFILE_NAME};
use crate::resolver::resolve;
use crate::sources::cache::ArtifactCache;
use crate::sources::fetch::Fetcher;
use crate::sources::index::PackageIndex;
use crate::util::config::Config;
use crate::util::context::GlobalContext;
use crate::util::fs::{read_to_string, remove_dir_all_if_exists, write_atomic};
use crate::util::lock::KeyedLocks;

/// Registry-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum EnvError {
    #[error("environment `{name}` does not exist")]
    #[diagnostic(code(berth::env::not_found))]
    NotFound { name: String },

    #[error("environment `{name}` already exists")]
    #[diagnostic(
        code(berth::env::already_exists),
        help("destroy it first or pick another name")
    )]
    AlreadyExists { name: String },

    /// Refused because consumers still hold the environment.
    #[error("environment `{name}` is in use ({refs} active reference(s))")]
    #[diagnostic(code(berth::env::busy))]
    EnvironmentBusy { name: String, refs: usize },

    #[error("invalid environment name `{name}`: {reason}")]
    #[diagnostic(code(berth::env::invalid_name))]
    InvalidName { name: String, reason: String },
}

/// Check an environment name against `[A-Za-z0-9][A-Za-z0-9_.-]*`.
pub fn validate_env_name(name: &str) -> std::result::Result<(), EnvError> {
    let invalid = |reason: &str| EnvError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let mut chars = name.chars();
    match chars.next() {
        None => return Err(invalid("name cannot be empty")),
        Some(c) if !c.is_ascii_alphanumeric() => {
            return Err(invalid("must start with a letter or digit"))
        }
        Some(_) => {}
    }
    if let Some(c) = chars.find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))) {
        return Err(invalid(&format!("invalid character `{}`", c)));
    }
    Ok(())
}

/// A registered environment.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualEnvironment {
    pub name: String,
    pub root: PathBuf,
    pub lockfile: Lockfile,
    pub created: SystemTime,
    pub last_used: SystemTime,
    pub active_refs: usize,
}

/// One row of [`EnvironmentRegistry::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentSummary {
    pub name: String,
    pub root: PathBuf,
    pub packages: usize,
    pub created: SystemTime,
    pub last_used: SystemTime,
    pub active_refs: usize,
}

/// What [`EnvironmentRegistry::collect_garbage`] removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Idle environments that were destroyed
    pub destroyed: Vec<String>,
    /// Records whose root had vanished
    pub dropped: Vec<String>,
    /// Cache entries evicted afterwards
    pub evicted: Vec<Fingerprint>,
}

/// A consumer's hold on an environment. Destroying an environment is
/// refused while any lease on it is alive.
#[derive(Debug)]
pub struct EnvironmentLease {
    name: String,
    root: PathBuf,
    refs: Arc<AtomicUsize>,
}

impl EnvironmentLease {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for EnvironmentLease {
    fn drop(&mut self) {
        self.refs.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryState {
    #[serde(default, rename = "environment")]
    environments: BTreeMap<String, EnvironmentRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EnvironmentRecord {
    root: PathBuf,
    packages: usize,
    /// Milliseconds since the Unix epoch
    created: u64,
    last_used: u64,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn to_time(millis: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis)
}

/// Creates, finds, lists and destroys environments.
pub struct EnvironmentRegistry {
    context: GlobalContext,
    index: Arc<dyn PackageIndex>,
    cache: Arc<ArtifactCache>,
    builder: EnvironmentBuilder,
    locks: KeyedLocks<String>,
    state: Mutex<RegistryState>,
    leases: Mutex<HashMap<String, Arc<AtomicUsize>>>,
}

impl EnvironmentRegistry {
    /// Open the registry under `context`'s home directory.
    pub fn open(
        context: GlobalContext,
        config: Config,
        index: Arc<dyn PackageIndex>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self> {
        let cache = Arc::new(ArtifactCache::open(context.cache_dir(), fetcher, &config)?);
        let builder = EnvironmentBuilder::new(Arc::clone(&cache), &config);
        let state = load_state(&context.state_path())?;

        tracing::debug!(
            "Opened registry at {} ({} environments)",
            context.home().display(),
            state.environments.len()
        );

        Ok(EnvironmentRegistry {
            context,
            index,
            cache,
            builder,
            locks: KeyedLocks::new(),
            state: Mutex::new(state),
            leases: Mutex::new(HashMap::new()),
        })
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    /// Where environment `name` lives.
    pub fn root_for(&self, name: &str) -> PathBuf {
        self.context.envs_dir().join(name)
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, state: &RegistryState) -> Result<()> {
        let content = toml::to_string_pretty(state).context("failed to serialize registry state")?;
        write_atomic(&self.context.state_path(), content.as_bytes())?;
        Ok(())
    }

    fn record(&self, name: &str) -> Result<EnvironmentRecord> {
        self.state()
            .environments
            .get(name)
            .cloned()
            .ok_or_else(|| {
                EnvError::NotFound {
                    name: name.to_string(),
                }
                .into()
            })
    }

    fn active_refs(&self, name: &str) -> usize {
        self.leases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map_or(0, |refs| refs.load(Ordering::SeqCst))
    }

    fn touch(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        if let Some(record) = state.environments.get_mut(name) {
            record.last_used = now_millis();
            self.persist(&state)?;
        }
        Ok(())
    }

    fn environment(&self, name: &str, record: &EnvironmentRecord) -> Result<VirtualEnvironment> {
        let lockfile = Lockfile::load(&record.root.join(LOCKFILE_NAME))?;
        Ok(VirtualEnvironment {
            name: name.to_string(),
            root: record.root.clone(),
            lockfile,
            created: to_time(record.created),
            last_used: to_time(record.last_used),
            active_refs: self.active_refs(name),
        })
    }

    /// Resolve `manifest`, fetch its artifacts and materialize a new
    /// environment called `name`.
    pub fn create(&self, name: &str, manifest: &Manifest) -> Result<VirtualEnvironment> {
        validate_env_name(name)?;
        let _guard = self.locks.lock(&name.to_string());

        if self.state().environments.contains_key(name) {
            return Err(EnvError::AlreadyExists {
                name: name.to_string(),
            }
            .into());
        }

        let graph = resolve(manifest, self.index.as_ref())?;
        let lockfile = Lockfile::from_graph(&graph, manifest)
            .with_manifest_hash(compute_manifest_hash(manifest));
        let root = self.root_for(name);

        // Pin before acquiring so eviction cannot race the build.
        self.cache
            .add_refs(name, lockfile.packages.iter().map(|p| &p.fingerprint))?;
        if let Err(e) = self.builder.materialize(name, &lockfile, &root) {
            if let Err(release) = self.cache.release_owner(name) {
                tracing::warn!("Failed to release cache references of `{}`: {}", name, release);
            }
            return Err(e.into());
        }

        let now = now_millis();
        let record = EnvironmentRecord {
            root,
            packages: lockfile.packages.len(),
            created: now,
            last_used: now,
        };
        {
            let mut state = self.state();
            state.environments.insert(name.to_string(), record.clone());
            self.persist(&state)?;
        }

        tracing::info!(
            "Created environment `{}` with {} packages",
            name,
            lockfile.packages.len()
        );
        Ok(VirtualEnvironment {
            name: name.to_string(),
            root: record.root,
            lockfile,
            created: to_time(now),
            last_used: to_time(now),
            active_refs: 0,
        })
    }

    /// Look up an environment by name.
    pub fn get(&self, name: &str) -> Result<VirtualEnvironment> {
        let record = self.record(name)?;
        self.environment(name, &record)
    }

    /// All environments, sorted by name.
    pub fn list(&self) -> Vec<EnvironmentSummary> {
        let state = self.state();
        state
            .environments
            .iter()
            .map(|(name, record)| EnvironmentSummary {
                name: name.clone(),
                root: record.root.clone(),
                packages: record.packages,
                created: to_time(record.created),
                last_used: to_time(record.last_used),
                active_refs: self.active_refs(name),
            })
            .collect()
    }

    /// Take a consumer reference on `name`.
    pub fn lease(&self, name: &str) -> Result<EnvironmentLease> {
        let _guard = self.locks.lock(&name.to_string());
        let record = self.record(name)?;

        let refs = Arc::clone(
            self.leases
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .entry(name.to_string())
                .or_default(),
        );
        refs.fetch_add(1, Ordering::SeqCst);
        self.touch(name)?;

        Ok(EnvironmentLease {
            name: name.to_string(),
            root: record.root,
            refs,
        })
    }

    /// Remove environment `name`, unless it is leased.
    pub fn destroy(&self, name: &str) -> Result<()> {
        let _guard = self.locks.lock(&name.to_string());
        let record = self.record(name)?;

        let refs = self.active_refs(name);
        if refs > 0 {
            return Err(EnvError::EnvironmentBusy {
                name: name.to_string(),
                refs,
            }
            .into());
        }

        remove_root(&record.root, name)?;
        self.cache.release_owner(name)?;
        {
            let mut state = self.state();
            state.environments.remove(name);
            self.persist(&state)?;
        }
        self.leases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);

        tracing::info!("Destroyed environment `{}`", name);
        Ok(())
    }

    /// Rebuild `name` from its stored lockfile.
    pub fn sync(&self, name: &str) -> Result<VirtualEnvironment> {
        let _guard = self.locks.lock(&name.to_string());
        let record = self.record(name)?;
        let lockfile = Lockfile::load(&record.root.join(LOCKFILE_NAME))?;

        self.cache
            .add_refs(name, lockfile.packages.iter().map(|p| &p.fingerprint))?;
        self.builder.materialize(name, &lockfile, &record.root)?;
        self.touch(name)?;

        let record = self.record(name)?;
        self.environment(name, &record)
    }

    /// Whether `manifest` differs from the one `name` was created from.
    pub fn is_stale(&self, name: &str, manifest: &Manifest) -> Result<bool> {
        let record = self.record(name)?;
        let lockfile = Lockfile::load(&record.root.join(LOCKFILE_NAME))?;
        Ok(!is_fresh(&lockfile, manifest))
    }

    /// Destroy environments unused for longer than `max_idle`, forget
    /// environments whose root is gone, then shrink the cache to its
    /// configured ceiling.
    pub fn collect_garbage(&self, max_idle: Duration) -> Result<GcReport> {
        let mut report = GcReport::default();
        let now = now_millis();
        let max_idle = max_idle.as_millis() as u64;

        let records: Vec<(String, EnvironmentRecord)> = self
            .state()
            .environments
            .iter()
            .map(|(name, record)| (name.clone(), record.clone()))
            .collect();

        for (name, record) in records {
            if !record.root.exists() {
                let _guard = self.locks.lock(&name);
                self.cache.release_owner(&name)?;
                let mut state = self.state();
                state.environments.remove(&name);
                self.persist(&state)?;
                tracing::info!("Dropped record of vanished environment `{}`", name);
                report.dropped.push(name);
            } else if now.saturating_sub(record.last_used) > max_idle
                && self.active_refs(&name) == 0
            {
                match self.destroy(&name) {
                    Ok(()) => report.destroyed.push(name),
                    Err(crate::Error::Env(EnvError::EnvironmentBusy { .. })) => {
                        tracing::debug!("Keeping `{}`: leased during collection", name)
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if let Some(ceiling) = self.cache.max_size() {
            report.evicted = self.cache.evict_to_fit(ceiling)?;
        }
        Ok(report)
    }
}

/// Remove an environment root with a rename first, so it disappears at once.
fn remove_root(root: &Path, name: &str) -> Result<()> {
    if std::fs::symlink_metadata(root).is_err() {
        return Ok(());
    }
    let parent = root.parent().unwrap_or(Path::new("."));
    let trash = tempfile::Builder::new()
        .prefix(&format!(".{}-removed-", name))
        .tempdir_in(parent)
        .context("failed to create removal directory")?;
    std::fs::rename(root, trash.path().join("env"))
        .with_context(|| format!("failed to remove {}", root.display()))?;
    remove_dir_all_if_exists(trash.path())?;
    Ok(())
}

fn load_state(path: &Path) -> Result<RegistryState> {
    if !path.exists() {
        return Ok(RegistryState::default());
    }
    let content = read_to_string(path)?;
    let state = toml::from_str(&content)
        .with_context(|| format!("failed to parse registry state: {}", path.display()))?;
    Ok(state)
}
