//! Caller-facing operations on monitors and incidents

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::fallback::{DispatchError, DispatchOutcome, FallbackOrchestrator};
use crate::incidents::IncidentLedger;
use crate::model::{DEFAULT_TIMEOUT_MS, Incident, IncidentId, Monitor, MonitorId, NewMonitor, ValidationError};
use crate::queue::CheckReason;
use crate::stats::DashboardStats;
use crate::storage::{StorageBackend, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid monitor: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// A newly stored monitor and what happened to its first check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreatedMonitor {
    pub monitor: Monitor,
    pub outcome: DispatchOutcome,
}

#[derive(Clone)]
pub struct MonitorService {
    store: Arc<dyn StorageBackend>,
    ledger: IncidentLedger,
    orchestrator: FallbackOrchestrator,
    default_timeout_ms: u64,
}

impl MonitorService {
    pub fn new(
        store: Arc<dyn StorageBackend>,
        ledger: IncidentLedger,
        orchestrator: FallbackOrchestrator,
    ) -> Self {
        Self {
            store,
            ledger,
            orchestrator,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    /// Request timeout for monitors created without one
    pub fn with_default_timeout_ms(mut self, default_timeout_ms: u64) -> Self {
        self.default_timeout_ms = default_timeout_ms;
        self
    }

    /// Validate, store and dispatch the first check of a monitor
    ///
    /// The monitor is stored even when its first check can be neither queued
    /// nor run; the outcome is then `Deferred`.
    #[instrument(skip(self, input), fields(url = %input.url))]
    pub async fn create_monitor(&self, input: NewMonitor) -> Result<CreatedMonitor, ServiceError> {
        let draft = input.validate(self.default_timeout_ms)?;
        let monitor = self.store.create_monitor(draft, Utc::now()).await?;

        let outcome = match self.orchestrator.dispatch(monitor.id, CheckReason::Create).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("initial check of monitor {} not dispatched: {e}", monitor.id);
                DispatchOutcome::Deferred
            }
        };
        info!("created monitor {} ({outcome})", monitor.id);

        let monitor = match outcome {
            DispatchOutcome::Inline => self.store.get_monitor(monitor.id).await?.unwrap_or(monitor),
            _ => monitor,
        };

        Ok(CreatedMonitor { monitor, outcome })
    }

    /// Pause an active monitor or resume a paused one
    ///
    /// Resuming also dispatches a manual check; a failure to do so is logged
    /// and does not undo the resume.
    #[instrument(skip(self))]
    pub async fn pause_or_resume(&self, id: MonitorId) -> Result<Option<Monitor>, ServiceError> {
        let Some(monitor) = self.store.toggle_pause(id, Utc::now()).await? else {
            return Ok(None);
        };

        if monitor.is_paused() {
            info!("paused monitor {id}");
        } else {
            info!("resumed monitor {id}");
            if let Err(e) = self.orchestrator.dispatch(id, CheckReason::Manual).await {
                warn!("check after resume of monitor {id} failed: {e}");
            }
        }

        Ok(Some(monitor))
    }

    /// Check a monitor now; `None` if it does not exist
    #[instrument(skip(self))]
    pub async fn run_now(&self, id: MonitorId) -> Result<Option<DispatchOutcome>, ServiceError> {
        if self.store.get_monitor(id).await?.is_none() {
            return Ok(None);
        }

        Ok(Some(self.orchestrator.dispatch(id, CheckReason::Manual).await?))
    }

    /// Resolve an incident by hand; `None` if unknown or already resolved
    pub async fn resolve_incident(&self, id: IncidentId) -> Result<Option<Incident>, ServiceError> {
        Ok(self.ledger.resolve_by_operator(id).await?)
    }

    pub async fn dashboard(&self) -> Result<DashboardStats, ServiceError> {
        let monitors = self.store.list_monitors().await?;
        let open_incidents = self.store.count_open_incidents().await?;
        Ok(DashboardStats::from_monitors(&monitors, open_incidents))
    }

    pub async fn monitors(&self) -> Result<Vec<Monitor>, ServiceError> {
        Ok(self.store.list_monitors().await?)
    }

    pub async fn monitor(&self, id: MonitorId) -> Result<Option<Monitor>, ServiceError> {
        Ok(self.store.get_monitor(id).await?)
    }

    /// Latest incidents across all monitors, newest first
    pub async fn incidents(&self, limit: usize) -> Result<Vec<Incident>, ServiceError> {
        Ok(self.store.list_incidents(limit).await?)
    }

    pub async fn monitor_incidents(
        &self,
        id: MonitorId,
        limit: usize,
    ) -> Result<Vec<Incident>, ServiceError> {
        Ok(self.store.list_monitor_incidents(id, limit).await?)
    }
}
