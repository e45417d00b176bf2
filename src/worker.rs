//! Worker pool - Executes check jobs from the queue
//!
//! ## Message Flow
//!
//! ```text
//! Poll tick / job finished → reserve job → CheckPipeline::run → complete | fail (retry policy)
//!     ↑
//!     └─── Commands (GetStats, Shutdown)
//! ```
//!
//! At most `concurrency` jobs run at once, bounded by a semaphore. Shutdown
//! stops taking new jobs and waits for every in-flight job before replying.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::pipeline::{CheckMode, CheckPipeline};
use crate::queue::{Job, JobDisposition, JobQueue, MONITOR_JOB_NAME};

/// Shortest poll and stall interval; `tokio::time::interval` rejects zero
const MIN_TICK: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Jobs executed at the same time
    pub concurrency: usize,

    /// How often an idle pool asks the queue for work
    pub poll_interval: Duration,

    /// Wait between connection attempts while the queue backend is down
    pub backend_retry_delay: Duration,

    /// Active jobs older than this are considered abandoned by a crashed worker
    pub stalled_after: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_millis(500),
            backend_retry_delay: Duration::from_secs(5),
            stalled_after: Duration::from_secs(120),
        }
    }
}

/// Counters since the pool started
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub ignored: u64,
    pub in_flight: usize,
}

#[derive(Debug)]
pub enum WorkerCommand {
    GetStats {
        respond_to: oneshot::Sender<WorkerStats>,
    },

    /// Stop taking jobs, drain in-flight ones, then reply
    Shutdown {
        respond_to: oneshot::Sender<WorkerStats>,
    },
}

/// How one job ended, as far as the pool's counters are concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobReport {
    Completed,
    Retried,
    Failed,
    Ignored,
}

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    pipeline: CheckPipeline,
    options: WorkerOptions,
    command_rx: mpsc::Receiver<WorkerCommand>,
    semaphore: Arc<Semaphore>,
    in_flight: JoinSet<JobReport>,
    stats: WorkerStats,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        pipeline: CheckPipeline,
        options: WorkerOptions,
        command_rx: mpsc::Receiver<WorkerCommand>,
    ) -> Self {
        let options = WorkerOptions {
            concurrency: options.concurrency.max(1),
            poll_interval: options.poll_interval.max(MIN_TICK),
            backend_retry_delay: options.backend_retry_delay.max(MIN_TICK),
            stalled_after: options.stalled_after.max(MIN_TICK),
        };
        Self {
            semaphore: Arc::new(Semaphore::new(options.concurrency)),
            queue,
            pipeline,
            options,
            command_rx,
            in_flight: JoinSet::new(),
            stats: WorkerStats::default(),
        }
    }

    /// Run the pool until shut down
    #[instrument(skip(self), fields(concurrency = self.options.concurrency))]
    pub async fn run(mut self) {
        debug!("starting worker pool");

        let mut shutdown_reply = None;

        if self.wait_for_backend(&mut shutdown_reply).await {
            self.requeue_stalled().await;

            let mut poll_ticker = interval(self.options.poll_interval);
            poll_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut stall_ticker = interval(self.options.stalled_after);
            stall_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            stall_ticker.tick().await;

            info!("worker pool consuming '{}' jobs", MONITOR_JOB_NAME);

            loop {
                tokio::select! {
                    _ = poll_ticker.tick() => self.fill().await,

                    _ = stall_ticker.tick() => self.requeue_stalled().await,

                    Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                        self.record(joined);
                        self.fill().await;
                    }

                    cmd = self.command_rx.recv() => match cmd {
                        Some(WorkerCommand::GetStats { respond_to }) => {
                            let _ = respond_to.send(self.snapshot());
                        }
                        Some(WorkerCommand::Shutdown { respond_to }) => {
                            debug!("received shutdown command");
                            shutdown_reply = Some(respond_to);
                            break;
                        }
                        None => {
                            warn!("command channel closed, shutting down");
                            break;
                        }
                    },
                }
            }
        }

        if !self.in_flight.is_empty() {
            info!("waiting for {} in-flight jobs", self.in_flight.len());
        }
        while let Some(joined) = self.in_flight.join_next().await {
            self.record(joined);
        }

        if let Some(respond_to) = shutdown_reply {
            let _ = respond_to.send(self.snapshot());
        }

        info!(
            completed = self.stats.completed,
            failed = self.stats.failed,
            "worker pool stopped"
        );
    }

    /// Block until the queue answers a ping; `false` if shut down meanwhile
    async fn wait_for_backend(
        &mut self,
        shutdown_reply: &mut Option<oneshot::Sender<WorkerStats>>,
    ) -> bool {
        loop {
            match self.queue.ping().await {
                Ok(()) => return true,
                Err(e) => warn!(
                    "queue backend unavailable ({e}), retrying in {:?}",
                    self.options.backend_retry_delay
                ),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.options.backend_retry_delay) => {}
                cmd = self.command_rx.recv() => match cmd {
                    Some(WorkerCommand::GetStats { respond_to }) => {
                        let _ = respond_to.send(self.snapshot());
                    }
                    Some(WorkerCommand::Shutdown { respond_to }) => {
                        *shutdown_reply = Some(respond_to);
                        return false;
                    }
                    None => return false,
                },
            }
        }
    }

    async fn requeue_stalled(&self) {
        if let Err(e) = self.queue.requeue_stalled(self.options.stalled_after).await {
            warn!("failed to requeue stalled jobs: {e}");
        }
    }

    /// Reserve jobs while there is spare capacity
    async fn fill(&mut self) {
        loop {
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                trace!("all workers busy");
                return;
            };

            match self.queue.reserve().await {
                Ok(Some(job)) => {
                    let queue = self.queue.clone();
                    let pipeline = self.pipeline.clone();
                    self.in_flight.spawn(process(queue, pipeline, job, permit));
                }
                Ok(None) => return,
                Err(e) => {
                    warn!("failed to reserve job: {e}");
                    return;
                }
            }
        }
    }

    fn record(&mut self, joined: Result<JobReport, tokio::task::JoinError>) {
        match joined {
            Ok(JobReport::Completed) => self.stats.completed += 1,
            Ok(JobReport::Retried) => self.stats.retried += 1,
            Ok(JobReport::Failed) => self.stats.failed += 1,
            Ok(JobReport::Ignored) => self.stats.ignored += 1,
            Err(e) => {
                error!("job task panicked: {e}");
                self.stats.failed += 1;
            }
        }
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            in_flight: self.in_flight.len(),
            ..self.stats
        }
    }
}

#[instrument(skip_all, fields(job = %job.id, monitor_id = job.monitor_id))]
async fn process(
    queue: Arc<dyn JobQueue>,
    pipeline: CheckPipeline,
    job: Job,
    _permit: OwnedSemaphorePermit,
) -> JobReport {
    if job.name != MONITOR_JOB_NAME {
        warn!("ignoring job with unknown name '{}'", job.name);
        if let Err(e) = queue.complete(&job).await {
            error!("failed to complete ignored job: {e}");
        }
        return JobReport::Ignored;
    }

    match pipeline.run(job.monitor_id, CheckMode::Full).await {
        Ok(_) => {
            if let Err(e) = queue.complete(&job).await {
                error!("failed to mark job completed: {e}");
            }
            debug!("job completed ({})", job.reason);
            JobReport::Completed
        }
        Err(e) => match queue.fail(&job, &e.to_string()).await {
            Ok(JobDisposition::Retrying { delay }) => {
                warn!("job attempt {} failed: {e}; retrying in {delay:?}", job.attempts_made);
                JobReport::Retried
            }
            Ok(JobDisposition::Failed) => {
                error!("job failed after {} attempts: {e}", job.attempts_made);
                JobReport::Failed
            }
            Err(qe) => {
                error!("job failed ({e}) and could not be rescheduled: {qe}");
                JobReport::Failed
            }
        },
    }
}

/// Handle for controlling a WorkerPool
#[derive(Clone)]
pub struct WorkerHandle {
    sender: mpsc::Sender<WorkerCommand>,
}

impl WorkerHandle {
    /// Spawn a new worker pool
    pub fn spawn(queue: Arc<dyn JobQueue>, pipeline: CheckPipeline, options: WorkerOptions) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let pool = WorkerPool::new(queue, pipeline, options, cmd_rx);

        tokio::spawn(pool.run());

        Self { sender: cmd_tx }
    }

    pub async fn stats(&self) -> Result<WorkerStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(WorkerCommand::GetStats { respond_to: tx })
            .await?;
        Ok(rx.await?)
    }

    /// Stop the pool and wait until all in-flight jobs have finished
    pub async fn shutdown(self) -> Result<WorkerStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(WorkerCommand::Shutdown { respond_to: tx })
            .await?;
        Ok(rx.await?)
    }
}
