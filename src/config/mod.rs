//! Configuration management.
//!
//! dripflow configuration can come from:
//! - Environment variables (DRIPFLOW_*)
//! - Config file (~/.config/dripflow/config.toml)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::conditions::ComparisonMode;
use crate::engine::{BackoffType, RetryPolicy};

/// dripflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Scheduler polling configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Graph-walk limits
    #[serde(default)]
    pub engine: EngineConfig,

    /// Retry/backoff policy for failed node executions
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Outbound message sender
    #[serde(default)]
    pub sender: SenderConfig,

    /// Condition evaluation
    #[serde(default)]
    pub conditions: ConditionsConfig,
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Delay between polls of the due-run set
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum runs claimed per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long a claimed run stays owned by this worker
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,

    /// Identity written into claimed rows
    #[serde(default = "default_worker_id")]
    pub worker_id: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            lease_seconds: default_lease_seconds(),
            worker_id: default_worker_id(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_batch_size() -> usize {
    100
}

fn default_lease_seconds() -> u64 {
    300
}

fn default_worker_id() -> String {
    format!("worker-{}", uuid::Uuid::new_v4())
}

/// Graph-walk configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Synchronous hops allowed per walk before yielding to the scheduler
    #[serde(default = "default_max_hops")]
    pub max_hops_per_walk: u32,

    /// Retry budget given to new runs
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_hops_per_walk: default_max_hops(),
            default_max_retries: default_max_retries(),
        }
    }
}

fn default_max_hops() -> u32 {
    100
}

fn default_max_retries() -> u32 {
    3
}

/// Message sender configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Delivery endpoint; when unset, sends are logged only
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Bound on a single send call (seconds)
    #[serde(default = "default_sender_timeout")]
    pub timeout_seconds: u64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_seconds: default_sender_timeout(),
        }
    }
}

fn default_sender_timeout() -> u64 {
    30
}

/// Condition evaluator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConditionsConfig {
    #[serde(default)]
    pub comparison: ComparisonMode,
}

impl Config {
    /// Load configuration from default locations.
    pub fn load() -> Self {
        let mut config = Self::default();

        let primary_path = Self::config_dir().join("config.toml");
        if let Ok(partial) = Self::load_partial_from_path(&primary_path) {
            config.apply_partial(partial);
        }

        config.apply_env_overrides();
        config
    }

    /// Get the data directory.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("dripflow"))
            .unwrap_or_else(|| PathBuf::from(".dripflow"))
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("dripflow"))
            .unwrap_or_else(|| PathBuf::from(".dripflow"))
    }

    /// Resolved database path.
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("dripflow.db"))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("DRIPFLOW_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
        if let Ok(ms) = std::env::var("DRIPFLOW_POLL_INTERVAL_MS") {
            if let Ok(parsed) = ms.parse::<u64>() {
                self.scheduler.poll_interval_ms = parsed;
            }
        }
        if let Ok(size) = std::env::var("DRIPFLOW_BATCH_SIZE") {
            if let Ok(parsed) = size.parse::<usize>() {
                self.scheduler.batch_size = parsed;
            }
        }
        if let Ok(worker) = std::env::var("DRIPFLOW_WORKER_ID") {
            self.scheduler.worker_id = worker;
        }
        if let Ok(hops) = std::env::var("DRIPFLOW_MAX_HOPS") {
            if let Ok(parsed) = hops.parse::<u32>() {
                self.engine.max_hops_per_walk = parsed;
            }
        }
        if let Ok(delay) = std::env::var("DRIPFLOW_RETRY_BASE_SECONDS") {
            if let Ok(parsed) = delay.parse::<u64>() {
                self.retry.base_delay_seconds = parsed;
            }
        }
        if let Ok(backoff) = std::env::var("DRIPFLOW_RETRY_BACKOFF") {
            if let Ok(parsed) = backoff.to_lowercase().parse::<BackoffType>() {
                self.retry.backoff = parsed;
            }
        }
        if let Ok(endpoint) = std::env::var("DRIPFLOW_SENDER_ENDPOINT") {
            self.sender.endpoint = Some(endpoint);
        }
        if let Ok(timeout) = std::env::var("DRIPFLOW_SENDER_TIMEOUT_SECONDS") {
            if let Ok(parsed) = timeout.parse::<u64>() {
                self.sender.timeout_seconds = parsed;
            }
        }
        if let Ok(mode) = std::env::var("DRIPFLOW_COMPARISON") {
            if let Ok(parsed) = mode.parse::<ComparisonMode>() {
                self.conditions.comparison = parsed;
            }
        }
    }

    fn load_partial_from_path(path: &Path) -> std::result::Result<PartialConfig, ()> {
        let content = std::fs::read_to_string(path).map_err(|_| ())?;
        Self::parse_partial(&content)
    }

    fn parse_partial(content: &str) -> std::result::Result<PartialConfig, ()> {
        toml::from_str(content).map_err(|_| ())
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        if let Some(storage) = partial.storage {
            self.storage = storage;
        }
        if let Some(scheduler) = partial.scheduler {
            self.scheduler = scheduler;
        }
        if let Some(engine) = partial.engine {
            self.engine = engine;
        }
        if let Some(retry) = partial.retry {
            self.retry = retry;
        }
        if let Some(sender) = partial.sender {
            self.sender = sender;
        }
        if let Some(conditions) = partial.conditions {
            self.conditions = conditions;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    storage: Option<StorageConfig>,
    scheduler: Option<SchedulerConfig>,
    engine: Option<EngineConfig>,
    retry: Option<RetryPolicy>,
    sender: Option<SenderConfig>,
    conditions: Option<ConditionsConfig>,
}
