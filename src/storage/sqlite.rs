//! SQLite storage backend implementation
//!
//! This module provides a SQLite-based implementation of the `StorageBackend` trait.
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Worker processes and the scheduler can share one file
//! - **Connection pooling**: Efficient resource usage
//! - **Migrations**: Automatic schema versioning with sqlx
//!
//! ## Atomicity
//!
//! - Incident updates are single conditional `UPDATE ... RETURNING` statements.
//! - At most one OPEN incident per monitor is enforced by a partial unique index.
//! - Check results are folded in with optimistic concurrency on the
//!   `revision` column, retried a bounded number of times.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument, warn};

use super::backend::{HealthStatus, StorageBackend};
use super::error::{StorageError, StorageResult};
use crate::model::{
    CheckResult, Incident, IncidentEvent, IncidentId, IncidentStatus, IntervalMinutes, Monitor,
    MonitorDraft, MonitorId, MonitorStatus, NewIncident,
};

/// How often a check result is re-applied after losing a revision race
const MAX_UPDATE_ATTEMPTS: usize = 5;

const MONITOR_COLUMNS: &str = r#"
    id, name, url, interval_minutes, timeout_ms, status, last_checked_at, next_check_at,
    last_response_time_ms, last_status_code, total_checks, total_failures,
    consecutive_failures, uptime_percentage, latency_samples, revision, created_at, updated_at
"#;

const INCIDENT_COLUMNS: &str = r#"
    id, monitor_id, monitor_name, monitor_url, message, status, started_at, resolved_at,
    last_failure_at, failure_count, last_error, events, created_at, updated_at
"#;

/// Open a WAL-mode connection pool on `db_path`
///
/// Shared by the store and the SQLite job queue. `acquire_timeout` bounds how
/// long a caller waits for a connection before the backend counts as
/// unreachable.
pub(crate) async fn connect_pool(
    db_path: &str,
    acquire_timeout: Duration,
) -> StorageResult<Pool<Sqlite>> {
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(30));

    SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(acquire_timeout)
        .connect_with(options)
        .await
        .map_err(|e| StorageError::ConnectionFailed(e.to_string()))
}

/// Helper to convert timestamp to Unix milliseconds for SQLite
pub(crate) fn timestamp_to_millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Helper to convert Unix milliseconds from SQLite to DateTime
pub(crate) fn millis_to_timestamp(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
}

fn column_u16(row: &SqliteRow, column: &str) -> StorageResult<Option<u16>> {
    row.try_get::<Option<i64>, _>(column)?
        .map(|value| {
            u16::try_from(value).map_err(|_| {
                StorageError::SerializationError(format!("{column} out of range: {value}"))
            })
        })
        .transpose()
}

fn column_u64(row: &SqliteRow, column: &str) -> StorageResult<u64> {
    let value: i64 = row.try_get(column)?;
    u64::try_from(value)
        .map_err(|_| StorageError::SerializationError(format!("{column} is negative: {value}")))
}

fn monitor_from_row(row: &SqliteRow) -> StorageResult<(Monitor, i64)> {
    let status: String = row.try_get("status")?;
    let interval: i64 = row.try_get("interval_minutes")?;
    let interval = u8::try_from(interval)
        .ok()
        .and_then(|minutes| IntervalMinutes::try_from(minutes).ok())
        .ok_or_else(|| StorageError::SerializationError(format!("invalid interval {interval}")))?;
    let samples: String = row.try_get("latency_samples")?;

    let monitor = Monitor {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        interval,
        timeout_ms: column_u64(row, "timeout_ms")?,
        status: status.parse().map_err(StorageError::SerializationError)?,
        last_checked_at: row
            .try_get::<Option<i64>, _>("last_checked_at")?
            .map(millis_to_timestamp),
        next_check_at: row
            .try_get::<Option<i64>, _>("next_check_at")?
            .map(millis_to_timestamp),
        last_response_time_ms: row
            .try_get::<Option<i64>, _>("last_response_time_ms")?
            .map(|ms| ms.max(0) as u64),
        last_status_code: column_u16(row, "last_status_code")?,
        total_checks: column_u64(row, "total_checks")?,
        total_failures: column_u64(row, "total_failures")?,
        consecutive_failures: column_u64(row, "consecutive_failures")?,
        uptime_percentage: row.try_get("uptime_percentage")?,
        latency_samples: serde_json::from_str(&samples)?,
        created_at: millis_to_timestamp(row.try_get("created_at")?),
        updated_at: millis_to_timestamp(row.try_get("updated_at")?),
    };

    Ok((monitor, row.try_get("revision")?))
}

fn incident_from_row(row: &SqliteRow) -> StorageResult<Incident> {
    let status: String = row.try_get("status")?;
    let events: String = row.try_get("events")?;

    Ok(Incident {
        id: row.try_get("id")?,
        monitor_id: row.try_get("monitor_id")?,
        monitor_name: row.try_get("monitor_name")?,
        monitor_url: row.try_get("monitor_url")?,
        message: row.try_get("message")?,
        status: status.parse().map_err(StorageError::SerializationError)?,
        started_at: millis_to_timestamp(row.try_get("started_at")?),
        resolved_at: row
            .try_get::<Option<i64>, _>("resolved_at")?
            .map(millis_to_timestamp),
        last_failure_at: millis_to_timestamp(row.try_get("last_failure_at")?),
        failure_count: column_u64(row, "failure_count")?,
        last_error: row.try_get("last_error")?,
        events: serde_json::from_str(&events)?,
        created_at: millis_to_timestamp(row.try_get("created_at")?),
        updated_at: millis_to_timestamp(row.try_get("updated_at")?),
    })
}

/// SQLite storage backend
///
/// Stores monitors and incidents in a local SQLite database file.
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Create a new SQLite backend
    ///
    /// This will:
    /// 1. Create the database file if it doesn't exist
    /// 2. Run migrations to create tables
    /// 3. Configure SQLite for concurrent access (WAL mode, busy timeout)
    ///
    /// ## Example
    ///
    /// ```no_run
    /// # use endpoint_monitoring::storage::sqlite::SqliteBackend;
    /// # async fn example() -> anyhow::Result<()> {
    /// let backend = SqliteBackend::new("./monitoring.db").await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let pool = connect_pool(&db_path_str, Duration::from_secs(30)).await?;

        info!("SQLite connection pool created");

        debug!("running database migrations");
        let mut migrator = sqlx::migrate!("./migrations/store");
        // the job queue may share this file and keeps its own migrations
        migrator.set_ignore_missing(true);
        migrator.run(&pool).await?;

        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    async fn fetch_monitor(&self, id: MonitorId) -> StorageResult<Option<(Monitor, i64)>> {
        let sql = format!("SELECT {MONITOR_COLUMNS} FROM monitors WHERE id = ?");
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| monitor_from_row(&row))
            .transpose()
    }

    async fn fetch_incidents(
        &self,
        filter: &str,
        monitor_id: Option<MonitorId>,
        limit: usize,
    ) -> StorageResult<Vec<Incident>> {
        let sql = format!(
            "SELECT {INCIDENT_COLUMNS} FROM incidents {filter} ORDER BY started_at DESC, id DESC LIMIT ?"
        );
        let mut query = sqlx::query(&sql);
        if let Some(monitor_id) = monitor_id {
            query = query.bind(monitor_id);
        }

        query
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(incident_from_row)
            .collect()
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    #[instrument(skip(self, draft), fields(url = %draft.url))]
    async fn create_monitor(&self, draft: MonitorDraft, now: DateTime<Utc>) -> StorageResult<Monitor> {
        let now_millis = timestamp_to_millis(&now);
        let sql = format!(
            r#"
            INSERT INTO monitors (
                name, url, interval_minutes, timeout_ms, status, next_check_at,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {MONITOR_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(&draft.name)
            .bind(&draft.url)
            .bind(i64::from(draft.interval.minutes()))
            .bind(draft.timeout_ms as i64)
            .bind(MonitorStatus::Unknown.to_string())
            .bind(now_millis)
            .bind(now_millis)
            .bind(now_millis)
            .fetch_one(&self.pool)
            .await?;

        let (monitor, _) = monitor_from_row(&row)?;
        debug!("created monitor {}", monitor.id);
        Ok(monitor)
    }

    async fn get_monitor(&self, id: MonitorId) -> StorageResult<Option<Monitor>> {
        Ok(self.fetch_monitor(id).await?.map(|(monitor, _)| monitor))
    }

    async fn list_monitors(&self) -> StorageResult<Vec<Monitor>> {
        let sql = format!("SELECT {MONITOR_COLUMNS} FROM monitors ORDER BY created_at DESC, id DESC");
        sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| monitor_from_row(row).map(|(monitor, _)| monitor))
            .collect()
    }

    #[instrument(skip(self))]
    async fn find_due_monitors(&self, now: DateTime<Utc>) -> StorageResult<Vec<MonitorId>> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM monitors
            WHERE status != 'paused' AND (next_check_at IS NULL OR next_check_at <= ?)
            ORDER BY id
            "#,
        )
        .bind(timestamp_to_millis(&now))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get("id").map_err(StorageError::from))
            .collect()
    }

    #[instrument(skip(self, result), fields(success = result.success))]
    async fn record_check(
        &self,
        id: MonitorId,
        result: &CheckResult,
        checked_at: DateTime<Utc>,
        latency_cap: usize,
    ) -> StorageResult<Option<Monitor>> {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let Some((mut monitor, revision)) = self.fetch_monitor(id).await? else {
                return Ok(None);
            };
            if monitor.is_paused() {
                debug!("monitor {id} paused, dropping check result");
                return Ok(None);
            }

            monitor.apply_check(result, checked_at, latency_cap);
            let samples = serde_json::to_string(&monitor.latency_samples)?;

            let updated = sqlx::query(
                r#"
                UPDATE monitors SET
                    name = ?, status = ?, last_checked_at = ?, next_check_at = ?,
                    last_response_time_ms = ?, last_status_code = ?, total_checks = ?,
                    total_failures = ?, consecutive_failures = ?, uptime_percentage = ?,
                    latency_samples = ?, updated_at = ?, revision = revision + 1
                WHERE id = ? AND revision = ? AND status != 'paused'
                "#,
            )
            .bind(&monitor.name)
            .bind(monitor.status.to_string())
            .bind(monitor.last_checked_at.as_ref().map(timestamp_to_millis))
            .bind(monitor.next_check_at.as_ref().map(timestamp_to_millis))
            .bind(monitor.last_response_time_ms.map(|ms| ms as i64))
            .bind(monitor.last_status_code.map(i64::from))
            .bind(monitor.total_checks as i64)
            .bind(monitor.total_failures as i64)
            .bind(monitor.consecutive_failures as i64)
            .bind(monitor.uptime_percentage)
            .bind(samples)
            .bind(timestamp_to_millis(&monitor.updated_at))
            .bind(id)
            .bind(revision)
            .execute(&self.pool)
            .await?;

            if updated.rows_affected() == 1 {
                return Ok(Some(monitor));
            }
            debug!("monitor {id} changed concurrently (attempt {attempt}), retrying");
        }

        warn!("giving up on check update for monitor {id}");
        Err(StorageError::Conflict {
            entity: "monitor",
            id,
        })
    }

    #[instrument(skip(self))]
    async fn toggle_pause(&self, id: MonitorId, now: DateTime<Utc>) -> StorageResult<Option<Monitor>> {
        let now_millis = timestamp_to_millis(&now);
        let sql = format!(
            r#"
            UPDATE monitors SET
                status = CASE WHEN status = 'paused' THEN 'unknown' ELSE 'paused' END,
                next_check_at = ?, updated_at = ?, revision = revision + 1
            WHERE id = ?
            RETURNING {MONITOR_COLUMNS}
            "#
        );

        sqlx::query(&sql)
            .bind(now_millis)
            .bind(now_millis)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| monitor_from_row(&row).map(|(monitor, _)| monitor))
            .transpose()
    }

    async fn find_open_incident(&self, monitor_id: MonitorId) -> StorageResult<Option<Incident>> {
        let sql = format!(
            r#"
            SELECT {INCIDENT_COLUMNS} FROM incidents
            WHERE monitor_id = ? AND status = 'OPEN'
            ORDER BY started_at DESC, id DESC
            LIMIT 1
            "#
        );

        sqlx::query(&sql)
            .bind(monitor_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| incident_from_row(&row))
            .transpose()
    }

    #[instrument(skip(self, incident), fields(monitor_id = incident.monitor_id))]
    async fn insert_open_incident(&self, incident: NewIncident) -> StorageResult<Incident> {
        let monitor_id = incident.monitor_id;
        let at = timestamp_to_millis(&incident.down_event.timestamp);
        let events = serde_json::to_string(&[&incident.down_event])?;
        let sql = format!(
            r#"
            INSERT INTO incidents (
                monitor_id, monitor_name, monitor_url, message, status, started_at,
                last_failure_at, failure_count, last_error, events, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?)
            RETURNING {INCIDENT_COLUMNS}
            "#
        );

        let inserted = sqlx::query(&sql)
            .bind(monitor_id)
            .bind(&incident.monitor_name)
            .bind(&incident.monitor_url)
            .bind(&incident.down_event.message)
            .bind(IncidentStatus::Open.to_string())
            .bind(at)
            .bind(at)
            .bind(&incident.last_error)
            .bind(events)
            .bind(at)
            .bind(at)
            .fetch_one(&self.pool)
            .await;

        match inserted {
            Ok(row) => incident_from_row(&row),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StorageError::DuplicateOpenIncident { monitor_id })
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, event, last_error))]
    async fn append_incident_failure(
        &self,
        incident_id: IncidentId,
        event: IncidentEvent,
        last_error: Option<String>,
    ) -> StorageResult<Option<Incident>> {
        let at = timestamp_to_millis(&event.timestamp);
        let sql = format!(
            r#"
            UPDATE incidents SET
                events = json_insert(events, '$[#]', json(?)),
                failure_count = failure_count + 1,
                last_failure_at = ?, last_error = ?, message = ?, updated_at = ?
            WHERE id = ? AND status = 'OPEN'
            RETURNING {INCIDENT_COLUMNS}
            "#
        );

        sqlx::query(&sql)
            .bind(serde_json::to_string(&event)?)
            .bind(at)
            .bind(last_error)
            .bind(&event.message)
            .bind(at)
            .bind(incident_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| incident_from_row(&row))
            .transpose()
    }

    #[instrument(skip(self, event, message))]
    async fn resolve_open_incident(
        &self,
        monitor_id: MonitorId,
        event: IncidentEvent,
        message: &str,
    ) -> StorageResult<Option<Incident>> {
        let at = timestamp_to_millis(&event.timestamp);
        let sql = format!(
            r#"
            UPDATE incidents SET
                status = 'RESOLVED', resolved_at = ?, message = ?, updated_at = ?,
                events = json_insert(events, '$[#]', json(?))
            WHERE status = 'OPEN' AND id = (
                SELECT id FROM incidents
                WHERE monitor_id = ? AND status = 'OPEN'
                ORDER BY started_at DESC, id DESC
                LIMIT 1
            )
            RETURNING {INCIDENT_COLUMNS}
            "#
        );

        sqlx::query(&sql)
            .bind(at)
            .bind(message)
            .bind(at)
            .bind(serde_json::to_string(&event)?)
            .bind(monitor_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| incident_from_row(&row))
            .transpose()
    }

    #[instrument(skip(self, event, message))]
    async fn resolve_incident(
        &self,
        incident_id: IncidentId,
        event: IncidentEvent,
        message: &str,
    ) -> StorageResult<Option<Incident>> {
        let at = timestamp_to_millis(&event.timestamp);
        let sql = format!(
            r#"
            UPDATE incidents SET
                status = 'RESOLVED', resolved_at = ?, message = ?, updated_at = ?,
                events = json_insert(events, '$[#]', json(?))
            WHERE id = ? AND status = 'OPEN'
            RETURNING {INCIDENT_COLUMNS}
            "#
        );

        sqlx::query(&sql)
            .bind(at)
            .bind(message)
            .bind(at)
            .bind(serde_json::to_string(&event)?)
            .bind(incident_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| incident_from_row(&row))
            .transpose()
    }

    async fn get_incident(&self, id: IncidentId) -> StorageResult<Option<Incident>> {
        let sql = format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE id = ?");
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| incident_from_row(&row))
            .transpose()
    }

    async fn list_incidents(&self, limit: usize) -> StorageResult<Vec<Incident>> {
        self.fetch_incidents("", None, limit).await
    }

    async fn list_monitor_incidents(
        &self,
        monitor_id: MonitorId,
        limit: usize,
    ) -> StorageResult<Vec<Incident>> {
        self.fetch_incidents("WHERE monitor_id = ?", Some(monitor_id), limit)
            .await
    }

    async fn count_open_incidents(&self) -> StorageResult<usize> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM incidents WHERE status = 'OPEN'")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0.max(0) as usize)
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => {
                let mut metadata = HashMap::new();
                metadata.insert("backend".to_string(), "sqlite".to_string());
                metadata.insert("db_path".to_string(), self.db_path.clone());

                Ok(HealthStatus {
                    healthy: true,
                    message: "SQLite backend operational".to_string(),
                    metadata,
                })
            }
            Err(e) => {
                warn!("health check failed: {}", e);
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check failed: {}", e),
                    metadata: HashMap::new(),
                })
            }
        }
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite backend");
        self.pool.close().await;
        Ok(())
    }
}
