//! SQLite-backed job queue
//!
//! Jobs live in the `jobs` table and survive restarts. Claiming is a single
//! conditional `UPDATE ... RETURNING`, so several worker processes can share
//! one database file without handing out a job twice.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument, warn};

use super::{
    CheckReason, Job, JobDisposition, JobOptions, JobQueue, JobState, MONITOR_QUEUE_NAME,
    QueueCounts, QueueError,
};
use crate::model::MonitorId;
use crate::storage::sqlite::{connect_pool, millis_to_timestamp, timestamp_to_millis};

const JOB_COLUMNS: &str = r#"
    id, name, monitor_id, reason, state, attempts_made, max_attempts, last_error,
    available_at, finished_at, created_at
"#;

fn job_from_row(row: &SqliteRow) -> Result<Job, QueueError> {
    let reason: String = row.try_get("reason")?;
    let state: String = row.try_get("state")?;
    let attempts_made: i64 = row.try_get("attempts_made")?;
    let max_attempts: i64 = row.try_get("max_attempts")?;

    Ok(Job {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        monitor_id: row.try_get("monitor_id")?,
        reason: reason.parse().map_err(QueueError::Backend)?,
        state: state.parse().map_err(QueueError::Backend)?,
        attempts_made: attempts_made.clamp(0, i64::from(u32::MAX)) as u32,
        max_attempts: max_attempts.clamp(0, i64::from(u32::MAX)) as u32,
        last_error: row.try_get("last_error")?,
        available_at: millis_to_timestamp(row.try_get("available_at")?),
        created_at: millis_to_timestamp(row.try_get("created_at")?),
        finished_at: row
            .try_get::<Option<i64>, _>("finished_at")?
            .map(millis_to_timestamp),
    })
}

pub struct SqliteQueue {
    pool: Pool<Sqlite>,
    options: JobOptions,
}

impl SqliteQueue {
    /// Open (or create) the queue database at `db_path`
    ///
    /// `connect_timeout` bounds how long any operation waits for a
    /// connection before failing with `QueueError::Unavailable`.
    #[instrument(skip_all)]
    pub async fn new(
        db_path: impl AsRef<Path>,
        options: JobOptions,
        connect_timeout: Duration,
    ) -> Result<Self, QueueError> {
        let db_path = db_path.as_ref().to_string_lossy().to_string();
        info!("opening SQLite job queue at: {}", db_path);

        let pool = connect_pool(&db_path, connect_timeout)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        let mut migrator = sqlx::migrate!("./migrations/queue");
        migrator.set_ignore_missing(true);
        migrator
            .run(&pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        Ok(Self { pool, options })
    }

    async fn prune(&self, state: JobState, keep: usize) -> Result<(), QueueError> {
        let removed = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE queue = ? AND state = ? AND id NOT IN (
                SELECT id FROM jobs
                WHERE queue = ? AND state = ?
                ORDER BY finished_at DESC
                LIMIT ?
            )
            "#,
        )
        .bind(MONITOR_QUEUE_NAME)
        .bind(state.to_string())
        .bind(MONITOR_QUEUE_NAME)
        .bind(state.to_string())
        .bind(keep as i64)
        .execute(&self.pool)
        .await?;

        if removed.rows_affected() > 0 {
            debug!("pruned {} {state} jobs", removed.rows_affected());
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for SqliteQueue {
    #[instrument(skip(self))]
    async fn add(&self, name: &str, monitor_id: MonitorId, reason: CheckReason) -> Result<Job, QueueError> {
        let job = Job::new(name, monitor_id, reason, &self.options, Utc::now());
        let created = timestamp_to_millis(&job.created_at);

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, queue, name, monitor_id, reason, state, attempts_made, max_attempts,
                backoff_ms, available_at, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&job.id)
        .bind(MONITOR_QUEUE_NAME)
        .bind(&job.name)
        .bind(job.monitor_id)
        .bind(job.reason.to_string())
        .bind(JobState::Waiting.to_string())
        .bind(i64::from(job.max_attempts))
        .bind(self.options.backoff.as_millis() as i64)
        .bind(created)
        .bind(created)
        .execute(&self.pool)
        .await?;

        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?");
        let row = sqlx::query(&sql).bind(&job.id).fetch_one(&self.pool).await?;
        job_from_row(&row)
    }

    async fn reserve(&self) -> Result<Option<Job>, QueueError> {
        let now = timestamp_to_millis(&Utc::now());
        let sql = format!(
            r#"
            UPDATE jobs SET
                state = 'active', attempts_made = attempts_made + 1, reserved_at = ?
            WHERE state = 'waiting' AND id = (
                SELECT id FROM jobs
                WHERE queue = ? AND state = 'waiting' AND available_at <= ?
                ORDER BY available_at, created_at
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        );

        sqlx::query(&sql)
            .bind(now)
            .bind(MONITOR_QUEUE_NAME)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| job_from_row(&row))
            .transpose()
    }

    async fn complete(&self, job: &Job) -> Result<(), QueueError> {
        let updated = sqlx::query(
            "UPDATE jobs SET state = 'completed', finished_at = ? WHERE id = ? AND state = 'active'",
        )
        .bind(timestamp_to_millis(&Utc::now()))
        .bind(&job.id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(QueueError::UnknownJob(job.id.clone()));
        }

        self.prune(JobState::Completed, self.options.keep_completed).await
    }

    #[instrument(skip(self, job), fields(job = %job.id))]
    async fn fail(&self, job: &Job, error: &str) -> Result<JobDisposition, QueueError> {
        let row = sqlx::query(
            "SELECT attempts_made, max_attempts FROM jobs WHERE id = ? AND state = 'active'",
        )
        .bind(&job.id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| QueueError::UnknownJob(job.id.clone()))?;

        let attempts_made: i64 = row.try_get("attempts_made")?;
        let max_attempts: i64 = row.try_get("max_attempts")?;
        let now = Utc::now();

        if attempts_made < max_attempts {
            let delay = self
                .options
                .backoff_delay(attempts_made.clamp(1, i64::from(u32::MAX)) as u32);
            let available_at = timestamp_to_millis(&now) + delay.as_millis() as i64;

            sqlx::query(
                r#"
                UPDATE jobs SET state = 'waiting', available_at = ?, last_error = ?, reserved_at = NULL
                WHERE id = ? AND state = 'active'
                "#,
            )
            .bind(available_at)
            .bind(error)
            .bind(&job.id)
            .execute(&self.pool)
            .await?;

            return Ok(JobDisposition::Retrying { delay });
        }

        sqlx::query(
            r#"
            UPDATE jobs SET state = 'failed', finished_at = ?, last_error = ?
            WHERE id = ? AND state = 'active'
            "#,
        )
        .bind(timestamp_to_millis(&now))
        .bind(error)
        .bind(&job.id)
        .execute(&self.pool)
        .await?;

        self.prune(JobState::Failed, self.options.keep_failed).await?;
        Ok(JobDisposition::Failed)
    }

    async fn requeue_stalled(&self, stalled_after: Duration) -> Result<usize, QueueError> {
        let now = Utc::now();
        let cutoff = timestamp_to_millis(&now) - stalled_after.as_millis() as i64;

        let updated = sqlx::query(
            r#"
            UPDATE jobs SET state = 'waiting', available_at = ?, reserved_at = NULL
            WHERE queue = ? AND state = 'active' AND reserved_at <= ?
            "#,
        )
        .bind(timestamp_to_millis(&now))
        .bind(MONITOR_QUEUE_NAME)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let requeued = updated.rows_affected() as usize;
        if requeued > 0 {
            warn!("requeued {requeued} stalled jobs");
        }
        Ok(requeued)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM jobs WHERE queue = ? GROUP BY state")
                .bind(MONITOR_QUEUE_NAME)
                .fetch_all(&self.pool)
                .await?;

        let mut counts = QueueCounts::default();
        for (state, count) in rows {
            let count = count.max(0) as usize;
            match state.parse().map_err(QueueError::Backend)? {
                JobState::Waiting => counts.waiting = count,
                JobState::Active => counts.active = count,
                JobState::Completed => counts.completed = count,
                JobState::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }
}
