//! Scheduler - Enqueues checks for due monitors
//!
//! Runs one tick immediately at start and then every `tick` interval. A tick
//! lists the monitors that are due and enqueues a `scheduler` job for each of
//! them concurrently; one failed enqueue does not stop the others.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, instrument, warn};

use crate::queue::{CheckReason, JobQueue};
use crate::storage::StorageBackend;

pub const DEFAULT_TICK: Duration = Duration::from_secs(60);

/// Result of one scheduler tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub due: usize,
    pub queued: usize,
    pub failed: usize,
}

pub struct Scheduler {
    store: Arc<dyn StorageBackend>,
    queue: Arc<dyn JobQueue>,

    /// Set after a failed due-monitor lookup, cleared by the next good tick
    store_warned: AtomicBool,
}

impl Scheduler {
    pub fn new(store: Arc<dyn StorageBackend>, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            store,
            queue,
            store_warned: AtomicBool::new(false),
        }
    }

    /// Enqueue every due monitor once
    ///
    /// Returns `None` when the due monitors could not be loaded; the failure
    /// is logged once until a tick succeeds again.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Option<TickSummary> {
        let due = match self.store.find_due_monitors(Utc::now()).await {
            Ok(due) => {
                if self.store_warned.swap(false, Ordering::SeqCst) {
                    info!("monitor store reachable again");
                }
                due
            }
            Err(e) => {
                if !self.store_warned.swap(true, Ordering::SeqCst) {
                    warn!("skipping scheduler tick, monitor store unavailable: {e}");
                } else {
                    debug!("monitor store still unavailable: {e}");
                }
                return None;
            }
        };

        if due.is_empty() {
            debug!("no due monitors");
            return Some(TickSummary::default());
        }

        let results = join_all(due.iter().map(|&monitor_id| async move {
            let queued = self.queue.enqueue(monitor_id, CheckReason::Scheduler).await;
            if let Err(e) = &queued {
                warn!("failed to enqueue check for monitor {monitor_id}: {e}");
            }
            queued.is_ok()
        }))
        .await;

        let queued = results.iter().filter(|ok| **ok).count();
        let summary = TickSummary {
            due: due.len(),
            queued,
            failed: due.len() - queued,
        };

        info!("queued {} monitor checks", summary.queued);
        Some(summary)
    }
}

#[derive(Debug)]
pub enum SchedulerCommand {
    /// Run a tick now, outside the regular interval
    TickNow {
        respond_to: oneshot::Sender<Option<TickSummary>>,
    },

    Shutdown,
}

/// Handle for controlling a running scheduler loop
#[derive(Clone)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    /// Spawn the scheduler loop; the first tick runs immediately
    pub fn spawn(scheduler: Scheduler, tick: Duration) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        tokio::spawn(run(scheduler, tick, cmd_rx));
        Self { sender: cmd_tx }
    }

    pub async fn tick_now(&self) -> Result<Option<TickSummary>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::TickNow { respond_to: tx })
            .await?;
        Ok(rx.await?)
    }

    pub async fn shutdown(self) {
        let _ = self.sender.send(SchedulerCommand::Shutdown).await;
    }
}

#[instrument(skip_all, fields(tick = ?tick))]
async fn run(scheduler: Scheduler, tick: Duration, mut command_rx: mpsc::Receiver<SchedulerCommand>) {
    debug!("starting scheduler");

    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                scheduler.tick().await;
            }

            Some(cmd) = command_rx.recv() => match cmd {
                SchedulerCommand::TickNow { respond_to } => {
                    let _ = respond_to.send(scheduler.tick().await);
                }
                SchedulerCommand::Shutdown => {
                    debug!("received shutdown command");
                    break;
                }
            },

            else => {
                warn!("command channel closed, shutting down");
                break;
            }
        }
    }

    debug!("scheduler stopped");
}
