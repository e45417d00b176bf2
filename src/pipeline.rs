//! One end-to-end check: probe, fold into the monitor, update incidents
//!
//! Shared by the worker pool and by the inline paths of the fallback
//! orchestrator.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, instrument};

use crate::checker::EndpointChecker;
use crate::incidents::{FailureReport, IncidentLedger, SuccessReport};
use crate::model::{CheckResult, DEFAULT_LATENCY_SAMPLES, Monitor, MonitorId};
use crate::storage::{StorageBackend, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// How a check is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    /// Use the monitor's own timeout and always commit the result
    Full,

    /// Probe with a shortened timeout and only commit a success
    ///
    /// A failed provisional probe leaves monitor and incidents untouched.
    Provisional { timeout: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// Monitor missing or paused; nothing was written
    Skipped,

    /// Result committed to the monitor and the incident ledger
    Checked { monitor: Monitor, result: CheckResult },

    /// Provisional probe failed and was not committed
    Discarded { result: CheckResult },
}

#[derive(Clone)]
pub struct CheckPipeline {
    store: Arc<dyn StorageBackend>,
    ledger: IncidentLedger,
    checker: EndpointChecker,
    latency_cap: usize,
}

impl CheckPipeline {
    pub fn new(
        store: Arc<dyn StorageBackend>,
        ledger: IncidentLedger,
        checker: EndpointChecker,
    ) -> Self {
        Self {
            store,
            ledger,
            checker,
            latency_cap: DEFAULT_LATENCY_SAMPLES,
        }
    }

    /// Override how many latency samples each monitor keeps
    pub fn with_latency_cap(mut self, latency_cap: usize) -> Self {
        self.latency_cap = latency_cap;
        self
    }

    #[instrument(skip(self))]
    pub async fn run(&self, monitor_id: MonitorId, mode: CheckMode) -> Result<PipelineOutcome, PipelineError> {
        let Some(monitor) = self.store.get_monitor(monitor_id).await? else {
            debug!("monitor {monitor_id} no longer exists");
            return Ok(PipelineOutcome::Skipped);
        };

        if monitor.is_paused() {
            debug!("monitor {monitor_id} is paused, skipping check");
            return Ok(PipelineOutcome::Skipped);
        }

        let timeout = match mode {
            CheckMode::Full => monitor.timeout(),
            CheckMode::Provisional { timeout } => timeout,
        };

        let result = self.checker.check(&monitor.url, timeout).await;

        if matches!(mode, CheckMode::Provisional { .. }) && !result.success {
            debug!("provisional check of monitor {monitor_id} failed, discarding");
            return Ok(PipelineOutcome::Discarded { result });
        }

        let checked_at = Utc::now();
        let Some(monitor) = self
            .store
            .record_check(monitor_id, &result, checked_at, self.latency_cap)
            .await?
        else {
            debug!("monitor {monitor_id} paused or removed during the check");
            return Ok(PipelineOutcome::Skipped);
        };

        if result.success {
            self.ledger
                .report_success(SuccessReport {
                    monitor_id,
                    checked_at,
                    status_code: result.status_code,
                    response_time_ms: result.response_time_ms,
                })
                .await?;
        } else {
            self.ledger
                .report_failure(FailureReport {
                    monitor_id,
                    monitor_name: monitor.name.clone(),
                    monitor_url: monitor.url.clone(),
                    checked_at,
                    status_code: result.status_code,
                    response_time_ms: result.response_time_ms,
                    error_message: result.error_message.clone(),
                })
                .await?;
        }

        Ok(PipelineOutcome::Checked { monitor, result })
    }
}
