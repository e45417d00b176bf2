//! Incident notifications
//!
//! Delivery is best-effort: the incident ledger logs a failed notification and
//! carries on, so an unreachable webhook never blocks an incident transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::model::{Incident, IncidentId, IncidentStatus, MonitorId};

/// What a notification says about an incident
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncidentAlert {
    pub incident_id: IncidentId,
    pub monitor_id: MonitorId,
    pub monitor_name: String,
    pub monitor_url: String,
    pub checked_at: DateTime<Utc>,
    pub status_code: Option<u16>,
    pub response_time_ms: Option<u64>,
    pub error_message: Option<String>,
}

impl IncidentAlert {
    /// Alert for the latest event recorded on `incident`
    ///
    /// A resolved incident carries no error.
    pub fn from_incident(incident: &Incident) -> Self {
        let last = incident.events.last();
        Self {
            incident_id: incident.id,
            monitor_id: incident.monitor_id,
            monitor_name: incident.monitor_name.clone(),
            monitor_url: incident.monitor_url.clone(),
            checked_at: last.map_or(incident.updated_at, |event| event.timestamp),
            status_code: last.and_then(|event| event.status_code),
            response_time_ms: last.and_then(|event| event.response_time_ms),
            error_message: match incident.status {
                IncidentStatus::Open => incident.last_error.clone(),
                IncidentStatus::Resolved => None,
            },
        }
    }
}

/// Outbound incident notifications
#[async_trait]
pub trait Notifier: Send + Sync {
    /// An outage started
    async fn notify_down(&self, alert: &IncidentAlert) -> anyhow::Result<()>;

    /// An outage ended
    async fn notify_recovered(&self, alert: &IncidentAlert) -> anyhow::Result<()>;
}

/// Notifier that only writes to the log
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_down(&self, alert: &IncidentAlert) -> anyhow::Result<()> {
        warn!(
            incident = alert.incident_id,
            "monitor '{}' is DOWN ({}): {}",
            alert.monitor_name,
            alert.monitor_url,
            alert.error_message.as_deref().unwrap_or("no error message")
        );
        Ok(())
    }

    async fn notify_recovered(&self, alert: &IncidentAlert) -> anyhow::Result<()> {
        info!(
            incident = alert.incident_id,
            "monitor '{}' recovered ({})", alert.monitor_name, alert.monitor_url
        );
        Ok(())
    }
}
