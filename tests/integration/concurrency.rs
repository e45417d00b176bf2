//! Concurrency and race condition tests
//!
//! These tests verify behavior under concurrent delivery:
//! - Simultaneous failure reports open exactly one incident
//! - Simultaneous check results are all counted
//! - The worker pool never exceeds its concurrency

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use endpoint_monitoring::{
    incidents::{FailureOutcome, FailureReport, IncidentLedger},
    model::{CheckResult, IncidentStatus},
    queue::{CheckReason, JobQueue, MemoryQueue},
    storage::{MemoryBackend, StorageBackend},
    worker::{WorkerHandle, WorkerOptions},
};
use futures::future::join_all;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

fn failure_report(monitor_id: i64) -> FailureReport {
    FailureReport {
        monitor_id,
        monitor_name: "racy".to_string(),
        monitor_url: "https://racy.example.com".to_string(),
        checked_at: Utc::now(),
        status_code: Some(502),
        response_time_ms: Some(12),
        error_message: Some("Received status code 502".to_string()),
    }
}

async fn concurrent_failures_open_one_incident(store: Arc<dyn StorageBackend>) {
    let notifier = Arc::new(RecordingNotifier::default());
    let ledger = IncidentLedger::new(store.clone(), notifier.clone());
    let monitor_id = create_test_monitor(store.as_ref(), "https://racy.example.com").await.id;

    let outcomes = join_all((0..16).map(|_| {
        let ledger = ledger.clone();
        tokio::spawn(async move { ledger.report_failure(failure_report(monitor_id)).await })
    }))
    .await;

    let opened = outcomes
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .filter(|outcome| matches!(outcome, FailureOutcome::Opened(_)))
        .count();
    assert_eq!(opened, 1);

    let incidents = store.list_monitor_incidents(monitor_id, 10).await.unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].status, IncidentStatus::Open);
    assert_eq!(incidents[0].failure_count, 16);
    assert_eq!(incidents[0].events.len(), 16);
    assert!(notifier.wait_for_alerts(1, 0).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_failures_memory() {
    concurrent_failures_open_one_incident(Arc::new(MemoryBackend::new())).await;
}

#[cfg(feature = "storage-sqlite")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_failures_sqlite() {
    use endpoint_monitoring::storage::sqlite::SqliteBackend;

    let dir = tempfile::tempdir().unwrap();
    let store = SqliteBackend::new(dir.path().join("race.db")).await.unwrap();
    concurrent_failures_open_one_incident(Arc::new(store)).await;
}

#[cfg(feature = "storage-sqlite")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_check_results_sqlite() {
    use endpoint_monitoring::storage::sqlite::SqliteBackend;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteBackend::new(dir.path().join("checks.db")).await.unwrap());
    let monitor_id = create_test_monitor(store.as_ref(), "https://busy.example.com").await.id;

    let results = join_all((0..4u64).map(|i| {
        let store = store.clone();
        tokio::spawn(async move {
            let result = if i % 2 == 0 {
                CheckResult::success(200, 10 + i)
            } else {
                CheckResult::failure(Some(500), Some(10 + i), "Received status code 500")
            };
            store.record_check(monitor_id, &result, Utc::now(), 300).await
        })
    }))
    .await;

    for joined in results {
        assert!(joined.unwrap().unwrap().is_some());
    }

    let monitor = store.get_monitor(monitor_id).await.unwrap().unwrap();
    assert_eq!(monitor.total_checks, 4);
    assert_eq!(monitor.total_failures, 2);
    assert_eq!(monitor.latency_samples.len(), 4);
    assert_eq!(monitor.uptime_percentage, 50.0);
}

#[tokio::test]
async fn test_worker_pool_respects_concurrency() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
        .mount(&server)
        .await;

    let queue = Arc::new(MemoryQueue::default());
    let engine = create_test_engine(Arc::new(MemoryBackend::new()), queue.clone());
    for _ in 0..6 {
        let monitor = create_test_monitor(engine.store.as_ref(), &server.uri()).await;
        queue.enqueue(monitor.id, CheckReason::Scheduler).await.unwrap();
    }

    let worker = WorkerHandle::spawn(
        queue.clone(),
        engine.pipeline.clone(),
        WorkerOptions {
            concurrency: 2,
            poll_interval: Duration::from_millis(20),
            ..WorkerOptions::default()
        },
    );

    let mut max_in_flight = 0;
    for _ in 0..200 {
        let stats = worker.stats().await.unwrap();
        max_in_flight = max_in_flight.max(stats.in_flight);
        if stats.completed == 6 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let stats = worker.shutdown().await.unwrap();
    assert_eq!(stats.completed, 6);
    assert!(max_in_flight <= 2, "saw {max_in_flight} jobs in flight");
    assert_eq!(server.received_requests().await.unwrap().len(), 6);
}
