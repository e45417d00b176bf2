//! Worker pool tests
//!
//! Jobs flow from the queue through the check pipeline; shutdown waits for
//! jobs already running.

use std::sync::Arc;
use std::time::Duration;

use endpoint_monitoring::{
    model::MonitorStatus,
    queue::{CheckReason, JobQueue, MemoryQueue},
    storage::MemoryBackend,
    worker::{WorkerHandle, WorkerOptions},
};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

fn fast_worker_options(concurrency: usize) -> WorkerOptions {
    WorkerOptions {
        concurrency,
        poll_interval: Duration::from_millis(20),
        backend_retry_delay: Duration::from_millis(50),
        ..WorkerOptions::default()
    }
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_jobs() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(400)))
        .mount(&server)
        .await;

    let queue = Arc::new(MemoryQueue::default());
    let engine = create_test_engine(Arc::new(MemoryBackend::new()), queue.clone());
    let mut ids = vec![];
    for _ in 0..3 {
        let monitor = create_test_monitor(engine.store.as_ref(), &server.uri()).await;
        queue.enqueue(monitor.id, CheckReason::Manual).await.unwrap();
        ids.push(monitor.id);
    }

    let worker = WorkerHandle::spawn(queue.clone(), engine.pipeline.clone(), fast_worker_options(3));
    assert!(wait_for_stats(&worker, |stats| stats.in_flight == 3).await);

    let stats = worker.shutdown().await.unwrap();
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.in_flight, 0);

    for id in ids {
        let monitor = engine.store.get_monitor(id).await.unwrap().unwrap();
        assert_eq!(monitor.status, MonitorStatus::Up);
    }
    assert_eq!(queue.counts().await.unwrap().completed, 3);
}

#[tokio::test]
async fn test_unknown_job_names_are_ignored() {
    let queue = Arc::new(MemoryQueue::default());
    let engine = create_test_engine(Arc::new(MemoryBackend::new()), queue.clone());
    queue.add("send-weekly-report", 1, CheckReason::Manual).await.unwrap();

    let worker = WorkerHandle::spawn(queue.clone(), engine.pipeline.clone(), fast_worker_options(1));
    assert!(wait_for_stats(&worker, |stats| stats.ignored == 1).await);

    let stats = worker.shutdown().await.unwrap();
    assert_eq!(stats.completed, 0);
    assert_eq!(queue.counts().await.unwrap().waiting, 0);
}

#[tokio::test]
async fn test_worker_waits_for_queue_backend() {
    let server = mock_endpoint(200).await;
    let queue = Arc::new(MemoryQueue::default());
    let engine = create_test_engine(Arc::new(MemoryBackend::new()), queue.clone());
    let monitor = create_test_monitor(engine.store.as_ref(), &server.uri()).await;
    queue.enqueue(monitor.id, CheckReason::Scheduler).await.unwrap();

    queue.set_online(false);
    let worker = WorkerHandle::spawn(queue.clone(), engine.pipeline.clone(), fast_worker_options(1));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(worker.stats().await.unwrap().completed, 0);

    queue.set_online(true);
    assert!(wait_for_stats(&worker, |stats| stats.completed == 1).await);
    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_while_backend_down() {
    let queue = Arc::new(MemoryQueue::default());
    queue.set_online(false);
    let engine = create_test_engine(Arc::new(MemoryBackend::new()), queue.clone());

    let worker = WorkerHandle::spawn(queue, engine.pipeline.clone(), fast_worker_options(1));
    let stats = tokio::time::timeout(Duration::from_secs(2), worker.shutdown())
        .await
        .expect("shutdown while waiting for the backend")
        .unwrap();
    assert_eq!(stats.completed, 0);
}

#[cfg(feature = "storage-sqlite")]
#[tokio::test]
async fn test_sqlite_store_and_queue_share_a_file() {
    use endpoint_monitoring::{
        fallback::DispatchOutcome,
        model::NewMonitor,
        queue::{JobOptions, sqlite::SqliteQueue},
        storage::sqlite::SqliteBackend,
    };

    let server = mock_endpoint(200).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("monitoring.db");

    let store = Arc::new(SqliteBackend::new(&path).await.unwrap());
    let queue = Arc::new(
        SqliteQueue::new(&path, JobOptions::default(), Duration::from_secs(1))
            .await
            .unwrap(),
    );
    let engine = create_test_engine(store, queue.clone());

    let created = engine
        .service
        .create_monitor(NewMonitor {
            name: None,
            url: server.uri(),
            interval_minutes: 5,
            timeout_ms: None,
        })
        .await
        .unwrap();
    assert_eq!(created.outcome, DispatchOutcome::Queued);

    let worker = WorkerHandle::spawn(queue.clone(), engine.pipeline.clone(), fast_worker_options(2));
    let id = created.monitor.id;
    let store = engine.store.clone();
    assert!(
        eventually(|| {
            let store = store.clone();
            async move { store.get_monitor(id).await.unwrap().unwrap().status == MonitorStatus::Up }
        })
        .await
    );

    worker.shutdown().await.unwrap();
    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.waiting, 0);
}
