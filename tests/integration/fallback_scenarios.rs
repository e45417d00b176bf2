//! Failure scenarios around the job queue
//!
//! These tests verify how caller-facing operations behave when the queue is
//! down or hangs:
//! - Monitor creation still succeeds and reports where the first check went
//! - Manual checks run inline
//! - Scheduler ticks count failed enqueues and leave monitors due

use std::sync::Arc;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use endpoint_monitoring::{
    fallback::DispatchOutcome,
    model::{MonitorStatus, NewMonitor},
    queue::MemoryQueue,
    scheduler::Scheduler,
    service::ServiceError,
    storage::MemoryBackend,
};

use crate::helpers::*;

fn new_monitor(url: String) -> NewMonitor {
    NewMonitor {
        name: Some("api".to_string()),
        url,
        interval_minutes: 1,
        timeout_ms: None,
    }
}

fn offline_queue() -> Arc<MemoryQueue> {
    let queue = Arc::new(MemoryQueue::default());
    queue.set_online(false);
    queue
}

#[tokio::test]
async fn test_create_with_queue_down_checks_inline() {
    let server = mock_endpoint(200).await;
    let engine = create_test_engine(Arc::new(MemoryBackend::new()), offline_queue());

    let created = engine.service.create_monitor(new_monitor(server.uri())).await.unwrap();

    assert_eq!(created.outcome, DispatchOutcome::Inline);
    assert_eq!(created.monitor.status, MonitorStatus::Up);
    assert_eq!(created.monitor.total_checks, 1);
}

#[tokio::test]
async fn test_create_with_queue_down_and_failing_endpoint_is_deferred() {
    let server = mock_endpoint(500).await;
    let engine = create_test_engine(Arc::new(MemoryBackend::new()), offline_queue());

    let created = engine.service.create_monitor(new_monitor(server.uri())).await.unwrap();

    assert_eq!(created.outcome, DispatchOutcome::Deferred);
    assert_eq!(created.monitor.status, MonitorStatus::Unknown);
    assert!(engine.store.find_open_incident(created.monitor.id).await.unwrap().is_none());
    assert!(engine.notifier.wait_for_alerts(0, 0).await);

    // still due, so the scheduler picks it up once the queue is back
    let due = engine.store.find_due_monitors(chrono::Utc::now()).await.unwrap();
    assert_eq!(due, vec![created.monitor.id]);
}

#[tokio::test]
async fn test_create_with_hanging_queue_is_bounded() {
    let server = mock_endpoint(200).await;
    let engine = create_test_engine(Arc::new(MemoryBackend::new()), Arc::new(HangingQueue));

    let started = Instant::now();
    let created = engine.service.create_monitor(new_monitor(server.uri())).await.unwrap();

    assert_eq!(created.outcome, DispatchOutcome::Inline);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_run_now_with_queue_down_runs_inline() {
    let server = mock_endpoint(500).await;
    let queue = Arc::new(MemoryQueue::default());
    let engine = create_test_engine(Arc::new(MemoryBackend::new()), queue.clone());

    let created = engine.service.create_monitor(new_monitor(server.uri())).await.unwrap();
    assert_eq!(created.outcome, DispatchOutcome::Queued);

    queue.set_online(false);
    let outcome = engine.service.run_now(created.monitor.id).await.unwrap();
    assert_eq!(outcome, Some(DispatchOutcome::Inline));

    let monitor = engine.service.monitor(created.monitor.id).await.unwrap().unwrap();
    assert_eq!(monitor.status, MonitorStatus::Down);
    assert!(engine.store.find_open_incident(monitor.id).await.unwrap().is_some());
    assert!(engine.notifier.wait_for_alerts(1, 0).await);
}

#[tokio::test]
async fn test_run_now_with_hanging_queue_times_out_then_runs_inline() {
    let server = mock_endpoint(200).await;
    let engine = create_test_engine(Arc::new(MemoryBackend::new()), Arc::new(HangingQueue));
    let monitor = create_test_monitor(engine.store.as_ref(), &server.uri()).await;

    let outcome = engine.service.run_now(monitor.id).await.unwrap();
    assert_eq!(outcome, Some(DispatchOutcome::Inline));
}

#[tokio::test]
async fn test_resume_with_queue_down_still_resumes() {
    let server = mock_endpoint(200).await;
    let queue = Arc::new(MemoryQueue::default());
    let engine = create_test_engine(Arc::new(MemoryBackend::new()), queue.clone());
    let monitor = create_test_monitor(engine.store.as_ref(), &server.uri()).await;

    engine.service.pause_or_resume(monitor.id).await.unwrap();
    queue.set_online(false);

    let resumed = engine.service.pause_or_resume(monitor.id).await.unwrap().unwrap();
    assert_ne!(resumed.status, MonitorStatus::Paused);
}

#[tokio::test]
async fn test_scheduler_tick_with_queue_down() {
    let engine = create_test_engine(Arc::new(MemoryBackend::new()), offline_queue());
    let monitor = create_test_monitor(engine.store.as_ref(), "https://example.com").await;

    let scheduler = Scheduler::new(engine.store.clone(), engine.queue.clone());
    let summary = scheduler.tick().await.unwrap();
    assert_eq!(summary.due, 1);
    assert_eq!(summary.failed, 1);

    // nothing was checked, the monitor stays due for the next tick
    let due = engine.store.find_due_monitors(chrono::Utc::now()).await.unwrap();
    assert_eq!(due, vec![monitor.id]);
}

#[tokio::test]
async fn test_invalid_monitor_is_rejected_before_dispatch() {
    let engine = create_test_engine(Arc::new(MemoryBackend::new()), offline_queue());

    let result = engine
        .service
        .create_monitor(NewMonitor {
            interval_minutes: 7,
            ..new_monitor("https://example.com".to_string())
        })
        .await;

    assert_matches!(result, Err(ServiceError::Validation(_)));
    assert!(engine.service.monitors().await.unwrap().is_empty());
}
