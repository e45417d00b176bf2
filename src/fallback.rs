//! Fallback orchestrator
//!
//! Caller-facing check requests go through the queue first. When the queue
//! does not accept the job in time, the reason decides what happens:
//!
//! | Reason      | Queue unavailable                                              |
//! |-------------|----------------------------------------------------------------|
//! | `manual`    | run the check inline, errors propagate → `Inline`              |
//! | `create`    | provisional inline check, bounded → `Inline` or `Deferred`     |
//! | `scheduler` | the enqueue error propagates                                   |

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::model::MonitorId;
use crate::pipeline::{CheckMode, CheckPipeline, PipelineError, PipelineOutcome};
use crate::queue::{CheckReason, JobQueue, QueueError};

/// Where a requested check ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchOutcome {
    /// Accepted by the job queue
    Queued,

    /// Executed directly in the caller's task
    Inline,

    /// Neither queued nor checked; the scheduler picks the monitor up later
    Deferred,
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchOutcome::Queued => write!(f, "queued"),
            DispatchOutcome::Inline => write!(f, "inline"),
            DispatchOutcome::Deferred => write!(f, "deferred"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("could not enqueue check: {0}")]
    Queue(#[from] QueueError),

    #[error("enqueue timed out after {0:?}")]
    EnqueueTimeout(Duration),

    #[error("inline check failed: {0}")]
    Inline(#[from] PipelineError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackOptions {
    /// Upper bound for handing a job to the queue
    pub enqueue_timeout: Duration,

    /// Request timeout of the inline check at create time
    pub create_inline_timeout: Duration,

    /// Extra time allowed on top of `create_inline_timeout` for the writes
    pub create_inline_grace: Duration,
}

impl Default for FallbackOptions {
    fn default() -> Self {
        Self {
            enqueue_timeout: Duration::from_millis(4_500),
            create_inline_timeout: Duration::from_millis(2_500),
            create_inline_grace: Duration::from_millis(1_000),
        }
    }
}

#[derive(Clone)]
pub struct FallbackOrchestrator {
    queue: Arc<dyn JobQueue>,
    pipeline: CheckPipeline,
    options: FallbackOptions,
}

impl FallbackOrchestrator {
    pub fn new(queue: Arc<dyn JobQueue>, pipeline: CheckPipeline, options: FallbackOptions) -> Self {
        Self {
            queue,
            pipeline,
            options,
        }
    }

    #[instrument(skip(self))]
    pub async fn dispatch(
        &self,
        monitor_id: MonitorId,
        reason: CheckReason,
    ) -> Result<DispatchOutcome, DispatchError> {
        let enqueue_error = match timeout(
            self.options.enqueue_timeout,
            self.queue.enqueue(monitor_id, reason),
        )
        .await
        {
            Ok(Ok(job)) => {
                debug!("queued job {}", job.id);
                return Ok(DispatchOutcome::Queued);
            }
            Ok(Err(e)) => DispatchError::Queue(e),
            Err(_) => DispatchError::EnqueueTimeout(self.options.enqueue_timeout),
        };

        warn!("queue unavailable for {reason} check of monitor {monitor_id}: {enqueue_error}");

        match reason {
            CheckReason::Manual => {
                self.pipeline.run(monitor_id, CheckMode::Full).await?;
                info!("ran manual check of monitor {monitor_id} inline");
                Ok(DispatchOutcome::Inline)
            }
            CheckReason::Create => Ok(self.create_inline(monitor_id).await),
            CheckReason::Scheduler => Err(enqueue_error),
        }
    }

    async fn create_inline(&self, monitor_id: MonitorId) -> DispatchOutcome {
        let mode = CheckMode::Provisional {
            timeout: self.options.create_inline_timeout,
        };
        let bound = self.options.create_inline_timeout + self.options.create_inline_grace;

        match timeout(bound, self.pipeline.run(monitor_id, mode)).await {
            Ok(Ok(PipelineOutcome::Checked { .. })) => {
                info!("ran initial check of monitor {monitor_id} inline");
                DispatchOutcome::Inline
            }
            Ok(Ok(outcome)) => {
                debug!("initial check deferred: {outcome:?}");
                DispatchOutcome::Deferred
            }
            Ok(Err(e)) => {
                warn!("initial inline check of monitor {monitor_id} failed: {e}");
                DispatchOutcome::Deferred
            }
            Err(_) => {
                warn!("initial inline check of monitor {monitor_id} exceeded {bound:?}");
                DispatchOutcome::Deferred
            }
        }
    }
}
