use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::alerts::AlertNotifier;
use crate::fallback::FallbackOptions;
use crate::model::{DEFAULT_LATENCY_SAMPLES, DEFAULT_TIMEOUT_MS, MAX_TIMEOUT_MS, MIN_TIMEOUT_MS};
use crate::notifier::{LogNotifier, Notifier};
use crate::queue::{JobOptions, JobQueue, MemoryQueue};
use crate::scheduler::DEFAULT_TICK;
use crate::storage::{MemoryBackend, StorageBackend};
use crate::worker::WorkerOptions;

const WORKER_CONCURRENCY: &str = "MONITOR_WORKER_CONCURRENCY";
const SCHEDULER_INTERVAL_SECS: &str = "MONITOR_SCHEDULER_INTERVAL_SECS";
const ENQUEUE_TIMEOUT_MS: &str = "MONITOR_ENQUEUE_TIMEOUT_MS";
const CREATE_INLINE_TIMEOUT_MS: &str = "MONITOR_CREATE_INLINE_TIMEOUT_MS";
const DEFAULT_MONITOR_TIMEOUT_MS: &str = "DEFAULT_MONITOR_TIMEOUT_MS";

/// Storage backend configuration
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence, single process only)
    #[serde(rename = "none")]
    None,

    /// SQLite database (default for most deployments)
    Sqlite {
        /// Path to the SQLite database file
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./monitoring.db")
}

/// Job queue backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    Memory,

    #[default]
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub backend: QueueBackend,

    /// SQLite file of the queue; may be the same file as the monitor store
    #[serde(default = "default_sqlite_path")]
    pub path: PathBuf,

    #[serde(default = "default_attempts")]
    pub attempts: u32,

    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    #[serde(default = "default_keep_completed")]
    pub keep_completed: usize,

    #[serde(default = "default_keep_failed")]
    pub keep_failed: usize,

    /// How long a queue operation may wait for a connection
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            path: default_sqlite_path(),
            attempts: default_attempts(),
            backoff_ms: default_backoff_ms(),
            keep_completed: default_keep_completed(),
            keep_failed: default_keep_failed(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl QueueConfig {
    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            attempts: self.attempts.max(1),
            backoff: Duration::from_millis(self.backoff_ms),
            keep_completed: self.keep_completed,
            keep_failed: self.keep_failed,
        }
    }
}

fn default_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    3_000
}

fn default_keep_completed() -> usize {
    1_000
}

fn default_keep_failed() -> usize {
    5_000
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_backend_retry_ms")]
    pub backend_retry_ms: u64,

    #[serde(default = "default_stalled_after_secs")]
    pub stalled_after_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            backend_retry_ms: default_backend_retry_ms(),
            stalled_after_secs: default_stalled_after_secs(),
        }
    }
}

impl WorkerConfig {
    pub fn options(&self) -> WorkerOptions {
        WorkerOptions {
            concurrency: self.concurrency.max(1),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            backend_retry_delay: Duration::from_millis(self.backend_retry_ms.max(1)),
            stalled_after: Duration::from_secs(self.stalled_after_secs.max(1)),
        }
    }
}

fn default_concurrency() -> usize {
    5
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_backend_retry_ms() -> u64 {
    5_000
}

fn default_stalled_after_secs() -> u64 {
    120
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }
}

fn default_tick_secs() -> u64 {
    DEFAULT_TICK.as_secs()
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct FallbackConfig {
    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,

    #[serde(default = "default_create_inline_timeout_ms")]
    pub create_inline_timeout_ms: u64,

    #[serde(default = "default_create_inline_grace_ms")]
    pub create_inline_grace_ms: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enqueue_timeout_ms: default_enqueue_timeout_ms(),
            create_inline_timeout_ms: default_create_inline_timeout_ms(),
            create_inline_grace_ms: default_create_inline_grace_ms(),
        }
    }
}

impl FallbackConfig {
    pub fn options(&self) -> FallbackOptions {
        FallbackOptions {
            enqueue_timeout: Duration::from_millis(self.enqueue_timeout_ms),
            create_inline_timeout: Duration::from_millis(self.create_inline_timeout_ms),
            create_inline_grace: Duration::from_millis(self.create_inline_grace_ms),
        }
    }
}

fn default_enqueue_timeout_ms() -> u64 {
    4_500
}

fn default_create_inline_timeout_ms() -> u64 {
    2_500
}

fn default_create_inline_grace_ms() -> u64 {
    1_000
}

fn default_latency_samples() -> usize {
    DEFAULT_LATENCY_SAMPLES
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alert {
    Discord(Discord),
    Webhook(Webhook),
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct Webhook {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct Discord {
    pub url: String,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct Config {
    /// Monitor and incident storage (defaults to SQLite)
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub fallback: FallbackConfig,

    /// Where incident transitions are announced; logged only when absent
    pub alert: Option<Alert>,

    /// Latency samples kept per monitor
    #[serde(default = "default_latency_samples")]
    pub latency_samples: usize,

    /// Request timeout for monitors created without one
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            scheduler: SchedulerConfig::default(),
            fallback: FallbackConfig::default(),
            alert: None,
            latency_samples: default_latency_samples(),
            default_timeout_ms: default_timeout_ms(),
        }
    }
}

impl Config {
    /// Pull `default_timeout_ms` into the range monitors accept
    fn clamped(mut self) -> Self {
        let timeout_ms = self.default_timeout_ms.clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS);
        if timeout_ms != self.default_timeout_ms {
            warn!(
                "default_timeout_ms {} out of range, using {timeout_ms}",
                self.default_timeout_ms
            );
            self.default_timeout_ms = timeout_ms;
        }
        self
    }

    /// Override tunables from environment style variables
    ///
    /// Values that are missing or do not parse leave the current setting
    /// untouched.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            let raw = lookup(key)?;
            let value = raw.trim().parse().ok();
            if value.is_none() {
                warn!("ignoring invalid value for {key}: {raw:?}");
            }
            value
        }

        if let Some(concurrency) = parsed::<usize>(&lookup, WORKER_CONCURRENCY).filter(|c| *c > 0) {
            self.worker.concurrency = concurrency;
        }
        if let Some(secs) = parsed::<u64>(&lookup, SCHEDULER_INTERVAL_SECS).filter(|s| *s > 0) {
            self.scheduler.tick_secs = secs;
        }
        if let Some(ms) = parsed(&lookup, ENQUEUE_TIMEOUT_MS) {
            self.fallback.enqueue_timeout_ms = ms;
        }
        if let Some(ms) = parsed(&lookup, CREATE_INLINE_TIMEOUT_MS) {
            self.fallback.create_inline_timeout_ms = ms;
        }
        if let Some(ms) = parsed::<u64>(&lookup, DEFAULT_MONITOR_TIMEOUT_MS) {
            self.default_timeout_ms = ms.clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS);
        }
    }
}

pub fn read_config_file(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str::<Config>(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))
        .map(Config::clamped)
        .inspect(|config| trace!("loaded config: {config:?}"))
}

/// Load `.env`, the optional config file and the environment overrides
pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
    dotenv::dotenv().ok();

    let mut config = match path {
        Some(path) => read_config_file(path)?,
        None => {
            debug!("no config file given, using defaults");
            Config::default()
        }
    };
    config.apply_env_overrides(|key| std::env::var(key).ok());

    Ok(config)
}

pub async fn connect_storage(config: &StorageConfig) -> anyhow::Result<Arc<dyn StorageBackend>> {
    match config {
        StorageConfig::None => {
            info!("using in-memory monitor storage");
            Ok(Arc::new(MemoryBackend::new()))
        }
        #[cfg(feature = "storage-sqlite")]
        StorageConfig::Sqlite { path } => {
            let backend = crate::storage::sqlite::SqliteBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "storage-sqlite"))]
        StorageConfig::Sqlite { .. } => {
            anyhow::bail!("SQLite storage requested but the storage-sqlite feature is disabled")
        }
    }
}

pub async fn connect_queue(config: &QueueConfig) -> anyhow::Result<Arc<dyn JobQueue>> {
    let options = config.job_options();
    match config.backend {
        QueueBackend::Memory => {
            info!("using in-memory job queue");
            Ok(Arc::new(MemoryQueue::new(options)))
        }
        #[cfg(feature = "storage-sqlite")]
        QueueBackend::Sqlite => {
            let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
            let queue = crate::queue::sqlite::SqliteQueue::new(&config.path, options, connect_timeout).await?;
            Ok(Arc::new(queue))
        }
        #[cfg(not(feature = "storage-sqlite"))]
        QueueBackend::Sqlite => {
            anyhow::bail!("SQLite queue requested but the storage-sqlite feature is disabled")
        }
    }
}

/// [`connect_queue`], retried every `retry_delay` until the backend opens
pub async fn connect_queue_retrying(config: &QueueConfig, retry_delay: Duration) -> Arc<dyn JobQueue> {
    loop {
        match connect_queue(config).await {
            Ok(queue) => return queue,
            Err(e) => warn!("queue backend unreachable ({e:#}), retrying in {retry_delay:?}"),
        }
        tokio::time::sleep(retry_delay).await;
    }
}

pub fn build_notifier(alert: Option<&Alert>) -> Arc<dyn Notifier> {
    match alert {
        Some(alert) => Arc::new(AlertNotifier::new(alert.clone())),
        None => Arc::new(LogNotifier),
    }
}
