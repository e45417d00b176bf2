//! Incident lifecycle tests
//!
//! Drive a monitor through an outage and a recovery and verify the monitor
//! statistics, the incident timeline and the alerts sent.

use std::sync::Arc;
use std::time::{Duration, Instant};

use endpoint_monitoring::{
    alerts::AlertNotifier,
    checker::EndpointChecker,
    config::{Alert, Webhook},
    incidents::{IncidentLedger, OPERATOR_RESOLVED_MESSAGE, RECOVERED_MESSAGE},
    model::{IncidentEventKind, IncidentStatus, MonitorStatus},
    pipeline::{CheckMode, CheckPipeline, PipelineOutcome},
    queue::MemoryQueue,
    storage::{MemoryBackend, StorageBackend},
};
use pretty_assertions::assert_eq;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn test_outage_and_recovery() {
    let server = mock_flapping_endpoint(5).await;
    let engine = create_test_engine(Arc::new(MemoryBackend::new()), Arc::new(MemoryQueue::default()));
    let monitor = create_test_monitor(engine.store.as_ref(), &server.uri()).await;

    for _ in 0..5 {
        let outcome = engine.pipeline.run(monitor.id, CheckMode::Full).await.unwrap();
        assert!(matches!(outcome, PipelineOutcome::Checked { ref result, .. } if !result.success));
    }

    let down = engine.store.get_monitor(monitor.id).await.unwrap().unwrap();
    assert_eq!(down.status, MonitorStatus::Down);
    assert_eq!(down.consecutive_failures, 5);
    assert_eq!(down.last_status_code, Some(500));

    let open = engine.store.find_open_incident(monitor.id).await.unwrap().unwrap();
    assert_eq!(open.failure_count, 5);
    assert_eq!(open.events.len(), 5);
    assert_eq!(open.events[0].kind, IncidentEventKind::Down);
    assert_eq!(open.events[0].message, "Received status code 500");
    assert!(open.events[1..].iter().all(|e| e.kind == IncidentEventKind::Retry));
    assert_eq!(open.message, "Received status code 500");
    assert_eq!(open.last_error.as_deref(), Some("Received status code 500"));
    assert!(engine.notifier.wait_for_alerts(1, 0).await);

    engine.pipeline.run(monitor.id, CheckMode::Full).await.unwrap();

    let up = engine.store.get_monitor(monitor.id).await.unwrap().unwrap();
    assert_eq!(up.status, MonitorStatus::Up);
    assert_eq!(up.consecutive_failures, 0);
    assert_eq!(up.total_checks, 6);
    assert_eq!(up.total_failures, 5);
    assert!(up.uptime_percentage < 20.0);
    assert_eq!(up.latency_samples.len(), 6);

    let resolved = engine.store.get_incident(open.id).await.unwrap().unwrap();
    assert_eq!(resolved.status, IncidentStatus::Resolved);
    assert_eq!(resolved.message, RECOVERED_MESSAGE);
    assert_eq!(resolved.events.len(), 6);
    assert_eq!(resolved.events.last().unwrap().kind, IncidentEventKind::Recovered);
    assert!(resolved.resolved_at.is_some());
    assert!(engine.notifier.wait_for_alerts(1, 1).await);

    assert!(engine.store.find_open_incident(monitor.id).await.unwrap().is_none());

    // a further success changes nothing on the resolved incident
    engine.pipeline.run(monitor.id, CheckMode::Full).await.unwrap();
    let unchanged = engine.store.get_incident(open.id).await.unwrap().unwrap();
    assert_eq!(unchanged, resolved);
    assert!(engine.notifier.wait_for_alerts(1, 1).await);
}

#[tokio::test]
async fn test_next_outage_opens_new_incident() {
    let server = mock_endpoint(503).await;
    let engine = create_test_engine(Arc::new(MemoryBackend::new()), Arc::new(MemoryQueue::default()));
    let monitor = create_test_monitor(engine.store.as_ref(), &server.uri()).await;

    engine.pipeline.run(monitor.id, CheckMode::Full).await.unwrap();
    let first = engine.store.find_open_incident(monitor.id).await.unwrap().unwrap();

    let resolved = engine.service.resolve_incident(first.id).await.unwrap().unwrap();
    assert_eq!(resolved.message, OPERATOR_RESOLVED_MESSAGE);
    assert!(engine.notifier.wait_for_alerts(1, 0).await);

    // already resolved
    assert!(engine.service.resolve_incident(first.id).await.unwrap().is_none());

    engine.pipeline.run(monitor.id, CheckMode::Full).await.unwrap();
    let second = engine.store.find_open_incident(monitor.id).await.unwrap().unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(second.failure_count, 1);

    let incidents = engine.service.monitor_incidents(monitor.id, 10).await.unwrap();
    assert_eq!(incidents.len(), 2);
    assert_eq!(incidents[0].id, second.id);
    assert_eq!(engine.service.dashboard().await.unwrap().open_incidents, 1);
}

#[tokio::test]
async fn test_paused_monitor_is_not_checked() {
    let server = mock_endpoint(500).await;
    let engine = create_test_engine(Arc::new(MemoryBackend::new()), Arc::new(MemoryQueue::default()));
    let monitor = create_test_monitor(engine.store.as_ref(), &server.uri()).await;

    engine.service.pause_or_resume(monitor.id).await.unwrap();

    let outcome = engine.pipeline.run(monitor.id, CheckMode::Full).await.unwrap();
    assert_eq!(outcome, PipelineOutcome::Skipped);
    assert!(server.received_requests().await.unwrap().is_empty());
    assert!(engine.store.find_open_incident(monitor.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_deleted_monitor_is_skipped() {
    let engine = create_test_engine(Arc::new(MemoryBackend::new()), Arc::new(MemoryQueue::default()));

    let outcome = engine.pipeline.run(404, CheckMode::Full).await.unwrap();
    assert_eq!(outcome, PipelineOutcome::Skipped);
}

/// Pipeline whose ledger alerts through a webhook answering with `response`
async fn pipeline_with_webhook(response: ResponseTemplate) -> (MockServer, Arc<MemoryBackend>, CheckPipeline) {
    let webhook = MockServer::start().await;
    Mock::given(method("POST")).respond_with(response).mount(&webhook).await;

    let store = Arc::new(MemoryBackend::new());
    let notifier = AlertNotifier::new(Alert::Webhook(Webhook { url: webhook.uri() }));
    let ledger = IncidentLedger::new(store.clone(), Arc::new(notifier));
    let pipeline = CheckPipeline::new(store.clone(), ledger, EndpointChecker::default());
    (webhook, store, pipeline)
}

#[tokio::test]
async fn test_slow_webhook_does_not_hold_up_checks() {
    let server = mock_flapping_endpoint(2).await;
    let (webhook, store, pipeline) =
        pipeline_with_webhook(ResponseTemplate::new(200).set_delay(Duration::from_secs(60))).await;
    let monitor = create_test_monitor(store.as_ref(), &server.uri()).await;

    let started = Instant::now();
    for _ in 0..3 {
        pipeline.run(monitor.id, CheckMode::Full).await.unwrap();
    }
    assert!(started.elapsed() < Duration::from_secs(5));

    let incidents = store.list_monitor_incidents(monitor.id, 10).await.unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].status, IncidentStatus::Resolved);
    assert_eq!(incidents[0].failure_count, 2);

    // both alerts were still attempted
    let webhook = &webhook;
    assert!(
        eventually(move || async move {
            webhook.received_requests().await.unwrap_or_default().len() == 2
        })
        .await
    );
}

#[tokio::test]
async fn test_failing_webhook_leaves_incident_intact() {
    let server = mock_endpoint(500).await;
    let (_webhook, store, pipeline) = pipeline_with_webhook(ResponseTemplate::new(500)).await;
    let monitor = create_test_monitor(store.as_ref(), &server.uri()).await;

    pipeline.run(monitor.id, CheckMode::Full).await.unwrap();
    pipeline.run(monitor.id, CheckMode::Full).await.unwrap();

    let open = store.find_open_incident(monitor.id).await.unwrap().unwrap();
    assert_eq!(open.failure_count, 2);
    assert_eq!(open.events.len(), 2);
}
