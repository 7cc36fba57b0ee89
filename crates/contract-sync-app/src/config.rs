use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
pub use contract_sync_cache::CacheConfig;
pub use contract_sync_core::ConflictStrategy;
use serde::{Deserialize, Serialize};

use crate::coordinator::CoordinatorConfig;

const CONFIG_DIR: &str = ".contract-sync";
const CONFIG_FILE: &str = "config.toml";

/// Top-level configuration loaded from `.contract-sync/config.toml`.
///
/// This is the only place the conflict strategy is configured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Timeouts, retries and windows for coordinated requests.
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    /// Limits of the shared cache.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Realtime consumer settings.
    #[serde(default)]
    pub sync: SyncSettings,
}

impl SyncConfig {
    /// Load configuration from the nearest ancestor of `start` that has a config file.
    ///
    /// Falls back to defaults when no ancestor carries one.
    ///
    /// # Errors
    /// Fails when the discovered file cannot be read, parsed or validated.
    pub fn load(start: impl AsRef<Path>) -> Result<Self> {
        match discover(start.as_ref()) {
            Some(path) => Self::from_path(path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from a known working directory.
    ///
    /// # Errors
    /// Fails when an existing file cannot be read, parsed or validated.
    pub fn from_workdir(workdir: impl AsRef<Path>) -> Result<Self> {
        let config_path = workdir.as_ref().join(CONFIG_DIR).join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        Self::from_path(config_path)
    }

    /// Load configuration from an explicit file.
    ///
    /// # Errors
    /// Fails when the file cannot be read, parsed or validated.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents =
            fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self =
            toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Reject limits that would disable the coordinator or the cache.
    ///
    /// # Errors
    /// Names the first offending key.
    pub fn validate(&self) -> Result<()> {
        validate_coordinator(&self.coordinator)?;
        validate_cache(&self.cache)?;
        self.sync.validate()
    }

    /// Render the effective configuration as TOML.
    ///
    /// # Errors
    /// Fails only if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize configuration")
    }
}

fn discover(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
        .find(|candidate| candidate.is_file())
}

fn validate_coordinator(config: &CoordinatorConfig) -> Result<()> {
    if config.timeout_ms == 0 {
        bail!("coordinator.timeout_ms must be greater than zero");
    }
    if config.retries == 0 {
        bail!("coordinator.retries must be at least 1");
    }
    if config.deduplication_window_ms == 0 {
        bail!("coordinator.deduplication_window_ms must be greater than zero");
    }
    if config.batch_window_ms == 0 {
        bail!("coordinator.batch_window_ms must be greater than zero");
    }
    if config.max_batch_size == 0 {
        bail!("coordinator.max_batch_size must be at least 1");
    }
    if config.backoff_cap_ms < config.backoff_base_ms {
        bail!(
            "coordinator.backoff_cap_ms ({}) must not be smaller than backoff_base_ms ({})",
            config.backoff_cap_ms,
            config.backoff_base_ms
        );
    }
    Ok(())
}

fn validate_cache(config: &CacheConfig) -> Result<()> {
    if config.max_total_bytes == 0 {
        bail!("cache.max_total_bytes must be greater than zero");
    }
    if config.max_entries == 0 {
        bail!("cache.max_entries must be at least 1");
    }
    if config.default_ttl_ms == 0 {
        bail!("cache.default_ttl_ms must be greater than zero");
    }
    if config.cleanup_interval_ms == 0 {
        bail!("cache.cleanup_interval_ms must be greater than zero");
    }
    Ok(())
}

/// Realtime consumer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Strategy applied when a push collides with a pending local write.
    pub conflict_strategy: ConflictStrategy,

    /// Name of the entity stream; also the cache key prefix.
    pub stream: String,

    /// Buffered notifications per subscriber before the slowest one lags.
    pub notification_capacity: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            conflict_strategy: ConflictStrategy::default(),
            stream: "contracts".into(),
            notification_capacity: 256,
        }
    }
}

impl SyncSettings {
    fn validate(&self) -> Result<()> {
        if self.stream.trim().is_empty() {
            bail!("sync.stream must not be empty");
        }
        if self.stream.contains(':') {
            bail!("sync.stream '{}' must not contain ':'", self.stream);
        }
        if self.notification_capacity == 0 {
            bail!("sync.notification_capacity must be at least 1");
        }
        Ok(())
    }
}
