//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use endpoint_monitoring::{
    checker::EndpointChecker,
    fallback::{FallbackOptions, FallbackOrchestrator},
    incidents::IncidentLedger,
    model::{IntervalMinutes, Monitor, MonitorDraft},
    notifier::{IncidentAlert, Notifier},
    pipeline::CheckPipeline,
    queue::{CheckReason, Job, JobDisposition, JobQueue, QueueCounts, QueueError},
    service::MonitorService,
    storage::StorageBackend,
    worker::{WorkerHandle, WorkerStats},
};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Notifier that counts the alerts it receives
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub down: AtomicUsize,
    pub recovered: AtomicUsize,
}

impl RecordingNotifier {
    pub fn down_count(&self) -> usize {
        self.down.load(Ordering::SeqCst)
    }

    pub fn recovered_count(&self) -> usize {
        self.recovered.load(Ordering::SeqCst)
    }

    /// Alerts are delivered on a background task: wait until the counts
    /// match, then make sure no further alert trails in
    pub async fn wait_for_alerts(&self, down: usize, recovered: usize) -> bool {
        let matches = || self.down_count() == down && self.recovered_count() == recovered;
        for _ in 0..250 {
            if matches() {
                tokio::time::sleep(Duration::from_millis(50)).await;
                return matches();
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_down(&self, _alert: &IncidentAlert) -> anyhow::Result<()> {
        self.down.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn notify_recovered(&self, _alert: &IncidentAlert) -> anyhow::Result<()> {
        self.recovered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Queue whose every operation hangs, like a backend that accepts the
/// connection but never answers
#[derive(Debug, Default)]
pub struct HangingQueue;

#[async_trait]
impl JobQueue for HangingQueue {
    async fn add(&self, _name: &str, _monitor_id: i64, _reason: CheckReason) -> Result<Job, QueueError> {
        std::future::pending().await
    }

    async fn reserve(&self) -> Result<Option<Job>, QueueError> {
        std::future::pending().await
    }

    async fn complete(&self, _job: &Job) -> Result<(), QueueError> {
        std::future::pending().await
    }

    async fn fail(&self, _job: &Job, _error: &str) -> Result<JobDisposition, QueueError> {
        std::future::pending().await
    }

    async fn requeue_stalled(&self, _stalled_after: Duration) -> Result<usize, QueueError> {
        std::future::pending().await
    }

    async fn ping(&self) -> Result<(), QueueError> {
        std::future::pending().await
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        std::future::pending().await
    }
}

/// Everything a test needs, wired against the given store and queue
pub struct TestEngine {
    pub store: Arc<dyn StorageBackend>,
    pub queue: Arc<dyn JobQueue>,
    pub notifier: Arc<RecordingNotifier>,
    pub ledger: IncidentLedger,
    pub pipeline: CheckPipeline,
    pub service: MonitorService,
}

pub fn fast_fallback_options() -> FallbackOptions {
    FallbackOptions {
        enqueue_timeout: Duration::from_millis(200),
        create_inline_timeout: Duration::from_millis(500),
        create_inline_grace: Duration::from_millis(300),
    }
}

pub fn create_test_engine(store: Arc<dyn StorageBackend>, queue: Arc<dyn JobQueue>) -> TestEngine {
    let notifier = Arc::new(RecordingNotifier::default());
    let ledger = IncidentLedger::new(store.clone(), notifier.clone());
    let pipeline = CheckPipeline::new(store.clone(), ledger.clone(), EndpointChecker::default());
    let orchestrator = FallbackOrchestrator::new(queue.clone(), pipeline.clone(), fast_fallback_options());
    let service = MonitorService::new(store.clone(), ledger.clone(), orchestrator);

    TestEngine {
        store,
        queue,
        notifier,
        ledger,
        pipeline,
        service,
    }
}

pub fn create_test_draft(url: &str) -> MonitorDraft {
    MonitorDraft {
        name: "test endpoint".to_string(),
        url: url.to_string(),
        interval: IntervalMinutes::One,
        timeout_ms: 2_000,
    }
}

pub async fn create_test_monitor(store: &dyn StorageBackend, url: &str) -> Monitor {
    store
        .create_monitor(create_test_draft(url), Utc::now())
        .await
        .expect("create monitor")
}

/// Endpoint answering every GET with `status`
pub async fn mock_endpoint(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;
    server
}

/// Endpoint failing `failures` times with a 500, then answering 200
pub async fn mock_flapping_endpoint(failures: u64) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(failures)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

/// Poll `condition` every 20ms for up to five seconds
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..250 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Poll the pool's stats until `predicate` holds, for up to five seconds
pub async fn wait_for_stats(worker: &WorkerHandle, predicate: impl Fn(&WorkerStats) -> bool) -> bool {
    for _ in 0..250 {
        if let Ok(stats) = worker.stats().await
            && predicate(&stats)
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
