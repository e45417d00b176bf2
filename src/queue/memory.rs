//! In-process job queue (no persistence)
//!
//! Jobs are lost when the process exits. Handed out in `available_at`
//! order, ties broken by insertion order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::{CheckReason, Job, JobDisposition, JobOptions, JobQueue, JobState, QueueCounts, QueueError};
use crate::model::MonitorId;

#[derive(Default)]
struct QueueState {
    /// job id -> (insertion sequence, job)
    jobs: HashMap<String, (u64, Job)>,
    next_seq: u64,
}

impl QueueState {
    fn prune(&mut self, state: JobState, keep: usize) {
        let mut finished: Vec<_> = self
            .jobs
            .values()
            .filter(|(_, job)| job.state == state)
            .map(|(seq, job)| (job.finished_at, *seq, job.id.clone()))
            .collect();

        if finished.len() <= keep {
            return;
        }

        finished.sort();
        let excess = finished.len() - keep;
        for (_, _, id) in finished.into_iter().take(excess) {
            self.jobs.remove(&id);
        }
    }

    fn active_mut(&mut self, id: &str) -> Result<&mut Job, QueueError> {
        self.jobs
            .get_mut(id)
            .map(|(_, job)| job)
            .filter(|job| job.state == JobState::Active)
            .ok_or_else(|| QueueError::UnknownJob(id.to_string()))
    }
}

pub struct MemoryQueue {
    state: Mutex<QueueState>,
    options: JobOptions,
    online: AtomicBool,
}

impl MemoryQueue {
    pub fn new(options: JobOptions) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            options,
            online: AtomicBool::new(true),
        }
    }

    /// Simulate losing (or regaining) the queue backend
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> Result<(), QueueError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::Unavailable("in-memory queue is offline".to_string()))
        }
    }

    async fn push(&self, job: Job) -> Job {
        let mut state = self.state.lock().await;

        if let Some((_, existing)) = state.jobs.get(&job.id) {
            debug!("job {} already queued", job.id);
            return existing.clone();
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.jobs.insert(job.id.clone(), (seq, job.clone()));
        trace!("queued job {}", job.id);
        job
    }

    /// Snapshot of a job by id, in any state
    pub async fn job(&self, id: &str) -> Option<Job> {
        self.state.lock().await.jobs.get(id).map(|(_, job)| job.clone())
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(JobOptions::default())
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn add(&self, name: &str, monitor_id: MonitorId, reason: CheckReason) -> Result<Job, QueueError> {
        self.ensure_online()?;
        Ok(self.push(Job::new(name, monitor_id, reason, &self.options, Utc::now())).await)
    }

    async fn reserve(&self) -> Result<Option<Job>, QueueError> {
        self.ensure_online()?;

        let now = Utc::now();
        let mut state = self.state.lock().await;
        let next = state
            .jobs
            .values_mut()
            .filter(|(_, job)| job.state == JobState::Waiting && job.available_at <= now)
            .min_by_key(|(seq, job)| (job.available_at, *seq));

        Ok(next.map(|(_, job)| {
            job.state = JobState::Active;
            job.attempts_made += 1;
            job.clone()
        }))
    }

    async fn complete(&self, job: &Job) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let stored = state.active_mut(&job.id)?;
        stored.state = JobState::Completed;
        stored.finished_at = Some(Utc::now());

        state.prune(JobState::Completed, self.options.keep_completed);
        Ok(())
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<JobDisposition, QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let stored = state.active_mut(&job.id)?;
        stored.last_error = Some(error.to_string());

        if stored.attempts_made < stored.max_attempts {
            let delay = self.options.backoff_delay(stored.attempts_made);
            stored.state = JobState::Waiting;
            stored.available_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
            return Ok(JobDisposition::Retrying { delay });
        }

        stored.state = JobState::Failed;
        stored.finished_at = Some(now);
        state.prune(JobState::Failed, self.options.keep_failed);
        Ok(JobDisposition::Failed)
    }

    async fn requeue_stalled(&self, _stalled_after: Duration) -> Result<usize, QueueError> {
        // active jobs here can only belong to this process
        Ok(0)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.ensure_online()
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for (_, job) in state.jobs.values() {
            match job.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}
