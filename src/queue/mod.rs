//! Durable job queue for endpoint checks
//!
//! Delivery is at-least-once: a job may run more than once (retry after a
//! storage error, requeue after a worker crash), so everything a job does must
//! be idempotent.
//!
//! ## Backends
//!
//! - **SQLite** (default): Durable, shared between worker and scheduler processes
//! - **In-Memory**: Single-process deployments and tests

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::MonitorId;

pub mod memory;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

pub use memory::MemoryQueue;

pub const MONITOR_QUEUE_NAME: &str = "monitor-health-checks";
pub const MONITOR_JOB_NAME: &str = "execute-monitor-check";

/// Why a check was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckReason {
    Create,
    Manual,
    Scheduler,
}

impl fmt::Display for CheckReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckReason::Create => write!(f, "create"),
            CheckReason::Manual => write!(f, "manual"),
            CheckReason::Scheduler => write!(f, "scheduler"),
        }
    }
}

impl FromStr for CheckReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(CheckReason::Create),
            "manual" => Ok(CheckReason::Manual),
            "scheduler" => Ok(CheckReason::Scheduler),
            other => Err(format!("unknown check reason '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Waiting => write!(f, "waiting"),
            JobState::Active => write!(f, "active"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// `"{monitor_id}:{reason}:{unix_millis}"`
    pub id: String,
    pub name: String,
    pub monitor_id: MonitorId,
    pub reason: CheckReason,
    pub state: JobState,

    /// Processing attempts started so far
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,

    /// Not handed out before this instant (retry backoff)
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        name: &str,
        monitor_id: MonitorId,
        reason: CheckReason,
        options: &JobOptions,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: job_id(monitor_id, reason, now),
            name: name.to_string(),
            monitor_id,
            reason,
            state: JobState::Waiting,
            attempts_made: 0,
            max_attempts: options.attempts,
            last_error: None,
            available_at: now,
            created_at: now,
            finished_at: None,
        }
    }
}

pub fn job_id(monitor_id: MonitorId, reason: CheckReason, now: DateTime<Utc>) -> String {
    format!("{monitor_id}:{reason}:{}", now.timestamp_millis())
}

/// Retry and retention policy applied to every job of a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    /// Total processing attempts, including the first
    pub attempts: u32,

    /// Delay before the first retry, doubled for every further one
    pub backoff: Duration,

    /// Most recent completed jobs kept for inspection
    pub keep_completed: usize,

    /// Most recent failed jobs kept for inspection
    pub keep_failed: usize,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(3),
            keep_completed: 1000,
            keep_failed: 5000,
        }
    }
}

impl JobOptions {
    /// Delay before retrying after the `attempt`-th failed attempt (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(1 << exponent)
    }
}

/// What happened to a job after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    Retrying { delay: Duration },
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue backend cannot be reached right now
    #[error("queue backend unavailable: {0}")]
    Unavailable(String),

    /// The job is not active in this queue
    #[error("job '{0}' is not active")]
    UnknownJob(String),

    #[error("queue backend error: {0}")]
    Backend(String),
}

#[cfg(feature = "storage-sqlite")]
impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                QueueError::Unavailable(err.to_string())
            }
            _ => QueueError::Backend(err.to_string()),
        }
    }
}

/// Job queue backend
///
/// Implementations must be `Send + Sync`; a queue is shared between the worker
/// pool, the scheduler and the fallback orchestrator.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job; a job with the same id is not added twice
    async fn add(&self, name: &str, monitor_id: MonitorId, reason: CheckReason) -> Result<Job, QueueError>;

    /// Add a check job for `monitor_id`
    async fn enqueue(&self, monitor_id: MonitorId, reason: CheckReason) -> Result<Job, QueueError> {
        self.add(MONITOR_JOB_NAME, monitor_id, reason).await
    }

    /// Claim the next available job, marking it active
    async fn reserve(&self) -> Result<Option<Job>, QueueError>;

    async fn complete(&self, job: &Job) -> Result<(), QueueError>;

    /// Record a failed attempt and apply the retry policy
    async fn fail(&self, job: &Job, error: &str) -> Result<JobDisposition, QueueError>;

    /// Return jobs that have been active for longer than `stalled_after` to
    /// the waiting state
    async fn requeue_stalled(&self, stalled_after: Duration) -> Result<usize, QueueError>;

    /// Check that the backend is reachable
    async fn ping(&self) -> Result<(), QueueError>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;
}
