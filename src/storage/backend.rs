//! Storage backend trait definition
//!
//! This module defines the core `StorageBackend` trait that all
//! storage implementations must implement.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::StorageResult;
use crate::model::{
    CheckResult, Incident, IncidentEvent, IncidentId, Monitor, MonitorDraft, MonitorId,
    NewIncident,
};

/// Health status of the storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: std::collections::HashMap<String, String>,
}

/// Repository for monitors and incidents
///
/// Monitors and incidents are written independently; no operation here spans
/// both entities. Every mutating operation is a single atomic, conditional
/// update so it can be replayed safely when a job is delivered twice.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync` as they are shared between the
/// worker pool, the scheduler and caller-facing operations.
///
/// ## Uniqueness
///
/// Implementations must guarantee at most one OPEN incident per monitor and
/// report a violating insert as `StorageError::DuplicateOpenIncident`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    // ========================================================================
    // Monitors
    // ========================================================================

    /// Store a new monitor with status `unknown`, due at `now`
    async fn create_monitor(&self, draft: MonitorDraft, now: DateTime<Utc>) -> StorageResult<Monitor>;

    async fn get_monitor(&self, id: MonitorId) -> StorageResult<Option<Monitor>>;

    /// All monitors, newest first
    async fn list_monitors(&self) -> StorageResult<Vec<Monitor>>;

    /// Monitors that are not paused and whose next check is unset or due
    async fn find_due_monitors(&self, now: DateTime<Utc>) -> StorageResult<Vec<MonitorId>>;

    /// Fold a check result into the monitor in one atomic update
    ///
    /// Returns `None` (and writes nothing) when the monitor does not exist or
    /// is paused.
    async fn record_check(
        &self,
        id: MonitorId,
        result: &CheckResult,
        checked_at: DateTime<Utc>,
        latency_cap: usize,
    ) -> StorageResult<Option<Monitor>>;

    /// Flip paused <-> unknown and make the monitor due at `now`
    async fn toggle_pause(&self, id: MonitorId, now: DateTime<Utc>) -> StorageResult<Option<Monitor>>;

    // ========================================================================
    // Incidents
    // ========================================================================

    async fn find_open_incident(&self, monitor_id: MonitorId) -> StorageResult<Option<Incident>>;

    /// Insert a new OPEN incident
    ///
    /// Fails with `StorageError::DuplicateOpenIncident` if the monitor
    /// already has one.
    async fn insert_open_incident(&self, incident: NewIncident) -> StorageResult<Incident>;

    /// Append a `retry` event to an incident that is still OPEN
    ///
    /// Returns `None` if the incident is missing or no longer open.
    async fn append_incident_failure(
        &self,
        incident_id: IncidentId,
        event: IncidentEvent,
        last_error: Option<String>,
    ) -> StorageResult<Option<Incident>>;

    /// Resolve the most recently started OPEN incident of a monitor
    async fn resolve_open_incident(
        &self,
        monitor_id: MonitorId,
        event: IncidentEvent,
        message: &str,
    ) -> StorageResult<Option<Incident>>;

    /// Resolve one incident by id, only if it is still OPEN
    async fn resolve_incident(
        &self,
        incident_id: IncidentId,
        event: IncidentEvent,
        message: &str,
    ) -> StorageResult<Option<Incident>>;

    async fn get_incident(&self, id: IncidentId) -> StorageResult<Option<Incident>>;

    /// Latest incidents by start time, newest first
    async fn list_incidents(&self, limit: usize) -> StorageResult<Vec<Incident>>;

    async fn list_monitor_incidents(
        &self,
        monitor_id: MonitorId,
        limit: usize,
    ) -> StorageResult<Vec<Incident>>;

    async fn count_open_incidents(&self) -> StorageResult<usize>;

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Check backend health
    ///
    /// Performs a lightweight operation to verify the backend
    /// is operational (e.g., ping database, check file access).
    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Close the backend and release resources
    async fn close(&self) -> StorageResult<()>;
}
