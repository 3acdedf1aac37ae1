use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::orchestration::{
    RunPolicy, DEFAULT_BACKOFF_BASE, DEFAULT_CANCEL_GRACE, DEFAULT_MAX_BACKOFF,
    DEFAULT_MAX_PARALLEL, DEFAULT_MAX_RETRIES,
};
use crate::state::{
    FileBackend, KvBackend, MemoryBackend, RateLimit, StateStore, DEFAULT_RETENTION,
    DEFAULT_WORKFLOW_TTL,
};
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_parallel: usize,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub max_backoff_ms: u64,
    pub task_timeout_secs: Option<u64>,
    pub cancel_grace_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base_ms: DEFAULT_BACKOFF_BASE.as_millis() as u64,
            max_backoff_ms: DEFAULT_MAX_BACKOFF.as_millis() as u64,
            task_timeout_secs: None,
            cancel_grace_secs: DEFAULT_CANCEL_GRACE.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    #[default]
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: BackendKind,
    /// Directory for the file backend. Defaults to `~/.cadence/store`.
    pub dir: Option<String>,
    pub workflow_ttl_secs: u64,
    pub retention_secs: u64,
    /// Guard workflow snapshot writes with a distributed lock.
    pub use_lock: bool,
    pub lock_ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::File,
            dir: None,
            workflow_ttl_secs: DEFAULT_WORKFLOW_TTL.as_secs(),
            retention_secs: DEFAULT_RETENTION.as_secs(),
            use_lock: false,
            lock_ttl_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub limit: u64,
    pub window_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Default template catalog for `cadence run`.
    pub catalog: Option<String>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    pub rate_limit: Option<RateLimitConfig>,
}

impl Config {
    pub fn cadence_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".cadence"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::cadence_dir()?.join("cadence.toml"))
    }

    /// Directory used by the file backend.
    pub fn store_dir(&self) -> Result<PathBuf> {
        match &self.store.dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::cadence_dir()?.join("store")),
        }
    }

    /// Catalog path from the config, if any.
    pub fn catalog_path(&self) -> Option<PathBuf> {
        self.catalog.as_deref().map(expand_tilde)
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        debug!(
            max_parallel = config.scheduler.max_parallel,
            backend = ?config.store.backend,
            use_lock = config.store.use_lock,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                debug!(dir = %parent.display(), "creating config directory");
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let cadence_dir = Self::cadence_dir()?;
        if !cadence_dir.exists() {
            debug!(dir = %cadence_dir.display(), "creating cadence directory");
            fs::create_dir_all(&cadence_dir)?;
        }
        if self.store.backend == BackendKind::File {
            let store_dir = self.store_dir()?;
            if !store_dir.exists() {
                debug!(dir = %store_dir.display(), "creating store directory");
                fs::create_dir_all(&store_dir)?;
            }
        }
        Ok(())
    }

    pub fn run_policy(&self) -> RunPolicy {
        let s = &self.scheduler;
        let mut policy = RunPolicy::default()
            .with_max_parallel(s.max_parallel)
            .with_max_retries(s.max_retries)
            .with_backoff(
                Duration::from_millis(s.backoff_base_ms),
                Duration::from_millis(s.max_backoff_ms),
            )
            .with_cancel_grace(Duration::from_secs(s.cancel_grace_secs));
        if let Some(secs) = s.task_timeout_secs {
            policy = policy.with_task_timeout(Duration::from_secs(secs));
        }
        policy
    }

    pub fn rate_limit(&self) -> Option<RateLimit> {
        self.rate_limit
            .map(|r| RateLimit::new(r.limit, Duration::from_millis(r.window_ms)))
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.store.lock_ttl_secs.max(1))
    }

    /// Open the configured backend.
    pub fn open_backend(&self) -> Result<Arc<dyn KvBackend>> {
        Ok(match self.store.backend {
            BackendKind::Memory => Arc::new(MemoryBackend::new()),
            BackendKind::File => Arc::new(FileBackend::new(self.store_dir()?)?),
        })
    }

    /// Store over `backend` with the configured TTLs.
    pub fn state_store(&self, backend: Arc<dyn KvBackend>) -> StateStore {
        StateStore::new(backend).with_ttls(
            Duration::from_secs(self.store.workflow_ttl_secs),
            Duration::from_secs(self.store.retention_secs),
        )
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
