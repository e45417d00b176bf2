//! In-memory storage backend (no persistence)
//!
//! Useful for:
//! - Testing without database dependencies
//! - Single-process deployments that can afford to lose history on restart
//!
//! All state lives behind one `RwLock`, so every mutating operation is
//! a single critical section. The OPEN-incident uniqueness check and the
//! insert happen under the same write guard.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, trace};

use super::backend::{HealthStatus, StorageBackend};
use super::error::{StorageError, StorageResult};
use crate::model::{
    CheckResult, Incident, IncidentEvent, IncidentId, Monitor, MonitorDraft, MonitorId,
    NewIncident,
};

#[derive(Default)]
struct MemoryState {
    monitors: HashMap<MonitorId, Monitor>,
    incidents: HashMap<IncidentId, Incident>,
    next_monitor_id: MonitorId,
    next_incident_id: IncidentId,
}

impl MemoryState {
    fn open_incident(&self, monitor_id: MonitorId) -> Option<&Incident> {
        self.incidents
            .values()
            .filter(|incident| incident.monitor_id == monitor_id && incident.is_open())
            .max_by_key(|incident| (incident.started_at, incident.id))
    }

    fn open_incident_mut(&mut self, monitor_id: MonitorId) -> Option<&mut Incident> {
        self.incidents
            .values_mut()
            .filter(|incident| incident.monitor_id == monitor_id && incident.is_open())
            .max_by_key(|incident| (incident.started_at, incident.id))
    }
}

/// In-memory storage backend
pub struct MemoryBackend {
    state: RwLock<MemoryState>,
}

impl MemoryBackend {
    /// Create a new in-memory backend
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState {
                next_monitor_id: 1,
                next_incident_id: 1,
                ..Default::default()
            }),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn newest_first(incidents: &mut [Incident]) {
    incidents.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn create_monitor(&self, draft: MonitorDraft, now: DateTime<Utc>) -> StorageResult<Monitor> {
        let mut state = self.state.write().await;
        let id = state.next_monitor_id;
        state.next_monitor_id += 1;

        let monitor = Monitor::from_draft(id, draft, now);
        state.monitors.insert(id, monitor.clone());
        debug!("created monitor {id} ({})", monitor.url);

        Ok(monitor)
    }

    async fn get_monitor(&self, id: MonitorId) -> StorageResult<Option<Monitor>> {
        Ok(self.state.read().await.monitors.get(&id).cloned())
    }

    async fn list_monitors(&self) -> StorageResult<Vec<Monitor>> {
        let state = self.state.read().await;
        let mut monitors: Vec<_> = state.monitors.values().cloned().collect();
        monitors.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(monitors)
    }

    async fn find_due_monitors(&self, now: DateTime<Utc>) -> StorageResult<Vec<MonitorId>> {
        let state = self.state.read().await;
        let mut due: Vec<_> = state
            .monitors
            .values()
            .filter(|monitor| monitor.is_due(now))
            .map(|monitor| monitor.id)
            .collect();
        due.sort_unstable();
        trace!("{} monitors due", due.len());
        Ok(due)
    }

    async fn record_check(
        &self,
        id: MonitorId,
        result: &CheckResult,
        checked_at: DateTime<Utc>,
        latency_cap: usize,
    ) -> StorageResult<Option<Monitor>> {
        let mut state = self.state.write().await;
        let Some(monitor) = state.monitors.get_mut(&id) else {
            return Ok(None);
        };

        if monitor.is_paused() {
            trace!("monitor {id} paused, dropping check result");
            return Ok(None);
        }

        monitor.apply_check(result, checked_at, latency_cap);
        Ok(Some(monitor.clone()))
    }

    async fn toggle_pause(&self, id: MonitorId, now: DateTime<Utc>) -> StorageResult<Option<Monitor>> {
        let mut state = self.state.write().await;
        Ok(state.monitors.get_mut(&id).map(|monitor| {
            monitor.toggle_pause(now);
            monitor.clone()
        }))
    }

    async fn find_open_incident(&self, monitor_id: MonitorId) -> StorageResult<Option<Incident>> {
        let state = self.state.read().await;
        Ok(state.open_incident(monitor_id).cloned())
    }

    async fn insert_open_incident(&self, incident: NewIncident) -> StorageResult<Incident> {
        let mut state = self.state.write().await;
        let monitor_id = incident.monitor_id;

        if state.open_incident(monitor_id).is_some() {
            return Err(StorageError::DuplicateOpenIncident { monitor_id });
        }

        let id = state.next_incident_id;
        state.next_incident_id += 1;

        let incident = incident.into_incident(id);
        state.incidents.insert(id, incident.clone());
        debug!("opened incident {id} for monitor {monitor_id}");

        Ok(incident)
    }

    async fn append_incident_failure(
        &self,
        incident_id: IncidentId,
        event: IncidentEvent,
        last_error: Option<String>,
    ) -> StorageResult<Option<Incident>> {
        let mut state = self.state.write().await;
        Ok(state
            .incidents
            .get_mut(&incident_id)
            .filter(|incident| incident.is_open())
            .map(|incident| {
                incident.push_retry(event, last_error);
                incident.clone()
            }))
    }

    async fn resolve_open_incident(
        &self,
        monitor_id: MonitorId,
        event: IncidentEvent,
        message: &str,
    ) -> StorageResult<Option<Incident>> {
        let mut state = self.state.write().await;
        Ok(state.open_incident_mut(monitor_id).map(|incident| {
            incident.resolve(event, message);
            incident.clone()
        }))
    }

    async fn resolve_incident(
        &self,
        incident_id: IncidentId,
        event: IncidentEvent,
        message: &str,
    ) -> StorageResult<Option<Incident>> {
        let mut state = self.state.write().await;
        Ok(state
            .incidents
            .get_mut(&incident_id)
            .filter(|incident| incident.is_open())
            .map(|incident| {
                incident.resolve(event, message);
                incident.clone()
            }))
    }

    async fn get_incident(&self, id: IncidentId) -> StorageResult<Option<Incident>> {
        Ok(self.state.read().await.incidents.get(&id).cloned())
    }

    async fn list_incidents(&self, limit: usize) -> StorageResult<Vec<Incident>> {
        let state = self.state.read().await;
        let mut incidents: Vec<_> = state.incidents.values().cloned().collect();
        newest_first(&mut incidents);
        incidents.truncate(limit);
        Ok(incidents)
    }

    async fn list_monitor_incidents(
        &self,
        monitor_id: MonitorId,
        limit: usize,
    ) -> StorageResult<Vec<Incident>> {
        let state = self.state.read().await;
        let mut incidents: Vec<_> = state
            .incidents
            .values()
            .filter(|incident| incident.monitor_id == monitor_id)
            .cloned()
            .collect();
        newest_first(&mut incidents);
        incidents.truncate(limit);
        Ok(incidents)
    }

    async fn count_open_incidents(&self) -> StorageResult<usize> {
        let state = self.state.read().await;
        Ok(state.incidents.values().filter(|incident| incident.is_open()).count())
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let state = self.state.read().await;
        Ok(HealthStatus {
            healthy: true,
            message: "In-memory storage operational".to_string(),
            metadata: HashMap::from([
                ("backend".to_string(), "memory".to_string()),
                ("monitors".to_string(), state.monitors.len().to_string()),
                ("incidents".to_string(), state.incidents.len().to_string()),
            ]),
        })
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing in-memory backend (no-op)");
        Ok(())
    }
}
