//! Storage persistence tests
//!
//! Monitors, incidents and jobs must survive a restart of the process.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use endpoint_monitoring::{
    incidents::{FailureOutcome, FailureReport, IncidentLedger},
    model::{CheckResult, IncidentEventKind, MonitorStatus},
    queue::{CheckReason, JobOptions, JobQueue, sqlite::SqliteQueue},
    scheduler::Scheduler,
    storage::{StorageBackend, sqlite::SqliteBackend},
};
use pretty_assertions::assert_eq;

use crate::helpers::*;

#[tokio::test]
async fn test_monitor_and_incident_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("monitoring.db");

    let (monitor_id, incident_id) = {
        let store = Arc::new(SqliteBackend::new(&path).await.unwrap());
        let monitor = create_test_monitor(store.as_ref(), "https://persist.example.com").await;

        let checked_at = Utc::now();
        let result = CheckResult::failure(Some(500), Some(42), "Received status code 500");
        store.record_check(monitor.id, &result, checked_at, 300).await.unwrap();

        let ledger = IncidentLedger::new(store.clone(), Arc::new(RecordingNotifier::default()));
        let outcome = ledger
            .report_failure(FailureReport {
                monitor_id: monitor.id,
                monitor_name: monitor.name.clone(),
                monitor_url: monitor.url.clone(),
                checked_at,
                status_code: Some(500),
                response_time_ms: Some(42),
                error_message: Some("Received status code 500".to_string()),
            })
            .await
            .unwrap();
        let FailureOutcome::Opened(incident) = outcome else {
            panic!("expected a new incident, got {outcome:?}");
        };

        store.close().await.unwrap();
        (monitor.id, incident.id)
    };

    let store = SqliteBackend::new(&path).await.unwrap();

    let monitor = store.get_monitor(monitor_id).await.unwrap().unwrap();
    assert_eq!(monitor.status, MonitorStatus::Down);
    assert_eq!(monitor.total_checks, 1);
    assert_eq!(monitor.latency_samples.len(), 1);
    assert_eq!(monitor.latency_samples[0].response_time_ms, Some(42));

    let incident = store.find_open_incident(monitor_id).await.unwrap().unwrap();
    assert_eq!(incident.id, incident_id);
    assert_eq!(incident.events.len(), 1);
    assert_eq!(incident.events[0].kind, IncidentEventKind::Down);
    assert_eq!(store.count_open_incidents().await.unwrap(), 1);
}

#[tokio::test]
async fn test_waiting_jobs_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");

    {
        let queue = SqliteQueue::new(&path, JobOptions::default(), Duration::from_secs(1))
            .await
            .unwrap();
        queue.enqueue(7, CheckReason::Scheduler).await.unwrap();
    }

    let queue = SqliteQueue::new(&path, JobOptions::default(), Duration::from_secs(1))
        .await
        .unwrap();
    let job = queue.reserve().await.unwrap().unwrap();
    assert_eq!(job.monitor_id, 7);
    assert_eq!(job.reason, CheckReason::Scheduler);
    assert_eq!(job.attempts_made, 1);
}

#[tokio::test]
async fn test_abandoned_jobs_are_requeued() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");
    let queue = SqliteQueue::new(&path, JobOptions::default(), Duration::from_secs(1))
        .await
        .unwrap();

    queue.enqueue(3, CheckReason::Manual).await.unwrap();
    let job = queue.reserve().await.unwrap().unwrap();

    // a crashed worker never completes the job
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.requeue_stalled(Duration::from_millis(10)).await.unwrap(), 1);

    let again = queue.reserve().await.unwrap().unwrap();
    assert_eq!(again.id, job.id);
    assert_eq!(again.attempts_made, 2);
}

#[tokio::test]
async fn test_scheduler_skips_tick_when_store_is_closed() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteBackend::new(dir.path().join("closed.db")).await.unwrap());
    create_test_monitor(store.as_ref(), "https://example.com").await;
    store.close().await.unwrap();

    let scheduler = Scheduler::new(store, Arc::new(endpoint_monitoring::queue::MemoryQueue::default()));
    assert_eq!(scheduler.tick().await, None);
    assert_eq!(scheduler.tick().await, None);
}
