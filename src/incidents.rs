//! Incident ledger
//!
//! Turns check outcomes into incident transitions:
//!
//! ```text
//! failure, no OPEN incident  → create OPEN (failure_count = 1, `down` event)
//! failure, OPEN incident     → append `retry`, failure_count += 1
//! success, OPEN incident     → RESOLVED (`recovered` event)
//! success, no OPEN incident  → nothing
//! ```
//!
//! Concurrent failures for the same monitor race on the create. The store
//! rejects all but one insert with `StorageError::DuplicateOpenIncident`; each
//! loser appends its failure to the winner's incident instead, so every report
//! is counted exactly once.
//!
//! Notifications go out on their own task. The ledger never waits for a
//! notifier, so a slow or dead alert channel cannot hold up a transition.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{Instrument, debug, debug_span, info, instrument, warn};

use crate::model::{Incident, IncidentEvent, IncidentEventKind, IncidentId, MonitorId, NewIncident};
use crate::notifier::{IncidentAlert, Notifier};
use crate::storage::{StorageBackend, StorageError, StorageResult};

pub const DOWN_MESSAGE: &str = "Endpoint returned an invalid response.";
pub const RETRY_MESSAGE: &str = "Endpoint still failing.";
pub const RECOVERED_EVENT_MESSAGE: &str = "Endpoint responded successfully.";
pub const RECOVERED_MESSAGE: &str = "Endpoint recovered successfully.";
pub const OPERATOR_RESOLVED_MESSAGE: &str = "Incident manually resolved by an operator.";

/// A failed check, as seen by the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub monitor_id: MonitorId,
    pub monitor_name: String,
    pub monitor_url: String,
    pub checked_at: DateTime<Utc>,
    pub status_code: Option<u16>,
    pub response_time_ms: Option<u64>,
    pub error_message: Option<String>,
}

impl FailureReport {
    fn event(&self, kind: IncidentEventKind, default_message: &str) -> IncidentEvent {
        IncidentEvent {
            kind,
            message: self
                .error_message
                .clone()
                .unwrap_or_else(|| default_message.to_string()),
            status_code: self.status_code,
            response_time_ms: self.response_time_ms,
            timestamp: self.checked_at,
        }
    }
}

/// A successful check, as seen by the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuccessReport {
    pub monitor_id: MonitorId,
    pub checked_at: DateTime<Utc>,
    pub status_code: Option<u16>,
    pub response_time_ms: Option<u64>,
}

/// What a failure report did to the incident history
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// A new outage started
    Opened(Incident),

    /// Counted against the ongoing outage
    Appended(Incident),

    /// The OPEN incident that beat us on create was resolved before the
    /// failure could be appended
    Vanished,
}

/// Incident state machine on top of a `StorageBackend`
#[derive(Clone)]
pub struct IncidentLedger {
    store: Arc<dyn StorageBackend>,
    notifier: Arc<dyn Notifier>,
}

impl IncidentLedger {
    pub fn new(store: Arc<dyn StorageBackend>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    #[instrument(skip(self, report), fields(monitor_id = report.monitor_id))]
    pub async fn report_failure(&self, report: FailureReport) -> StorageResult<FailureOutcome> {
        if let Some(incident) = self.append_to_open(&report).await? {
            return Ok(FailureOutcome::Appended(incident));
        }

        let new_incident = NewIncident {
            monitor_id: report.monitor_id,
            monitor_name: report.monitor_name.clone(),
            monitor_url: report.monitor_url.clone(),
            last_error: report.error_message.clone(),
            down_event: report.event(IncidentEventKind::Down, DOWN_MESSAGE),
        };

        match self.store.insert_open_incident(new_incident).await {
            Ok(incident) => {
                info!("opened incident {} for monitor {}", incident.id, incident.monitor_id);
                self.notify(&incident, true);
                Ok(FailureOutcome::Opened(incident))
            }
            Err(StorageError::DuplicateOpenIncident { .. }) => {
                debug!("lost incident creation race, appending to the winner");
                Ok(match self.append_to_open(&report).await? {
                    Some(incident) => FailureOutcome::Appended(incident),
                    None => FailureOutcome::Vanished,
                })
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, report), fields(monitor_id = report.monitor_id))]
    pub async fn report_success(&self, report: SuccessReport) -> StorageResult<Option<Incident>> {
        let event = IncidentEvent {
            kind: IncidentEventKind::Recovered,
            message: RECOVERED_EVENT_MESSAGE.to_string(),
            status_code: report.status_code,
            response_time_ms: report.response_time_ms,
            timestamp: report.checked_at,
        };

        let resolved = self
            .store
            .resolve_open_incident(report.monitor_id, event, RECOVERED_MESSAGE)
            .await?;

        if let Some(incident) = &resolved {
            info!("resolved incident {} for monitor {}", incident.id, incident.monitor_id);
            self.notify(incident, false);
        }

        Ok(resolved)
    }

    /// Resolve an incident by hand; `None` if it is unknown or already resolved
    #[instrument(skip(self))]
    pub async fn resolve_by_operator(&self, incident_id: IncidentId) -> StorageResult<Option<Incident>> {
        let event = IncidentEvent {
            kind: IncidentEventKind::Recovered,
            message: OPERATOR_RESOLVED_MESSAGE.to_string(),
            status_code: None,
            response_time_ms: None,
            timestamp: Utc::now(),
        };

        let resolved = self
            .store
            .resolve_incident(incident_id, event, OPERATOR_RESOLVED_MESSAGE)
            .await?;

        match &resolved {
            Some(_) => info!("incident {incident_id} resolved by operator"),
            None => debug!("incident {incident_id} missing or already resolved"),
        }

        Ok(resolved)
    }

    async fn append_to_open(&self, report: &FailureReport) -> StorageResult<Option<Incident>> {
        let Some(open) = self.store.find_open_incident(report.monitor_id).await? else {
            return Ok(None);
        };

        self.store
            .append_incident_failure(
                open.id,
                report.event(IncidentEventKind::Retry, RETRY_MESSAGE),
                report.error_message.clone(),
            )
            .await
    }

    fn notify(&self, incident: &Incident, down: bool) {
        let alert = IncidentAlert::from_incident(incident);
        let notifier = self.notifier.clone();
        let span = debug_span!("notify", incident = alert.incident_id, down);

        tokio::spawn(
            async move {
                let delivered = if down {
                    notifier.notify_down(&alert).await
                } else {
                    notifier.notify_recovered(&alert).await
                };

                if let Err(e) = delivered {
                    warn!("failed to deliver notification for incident {}: {e:#}", alert.incident_id);
                }
            }
            .instrument(span),
        );
    }
}
