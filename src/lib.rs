pub mod alerts;
pub mod checker;
pub mod config;
pub mod discord;
pub mod fallback;
pub mod incidents;
pub mod model;
pub mod notifier;
pub mod pipeline;
pub mod queue;
pub mod scheduler;
pub mod service;
pub mod stats;
pub mod storage;
pub mod worker;

use std::sync::Arc;

use crate::checker::EndpointChecker;
use crate::config::Config;
use crate::fallback::FallbackOrchestrator;
use crate::incidents::IncidentLedger;
use crate::pipeline::CheckPipeline;
use crate::queue::JobQueue;
use crate::service::MonitorService;
use crate::storage::StorageBackend;

/// Shared components of one process, wired from a [`Config`]
#[derive(Clone)]
pub struct Engine {
    pub store: Arc<dyn StorageBackend>,
    pub queue: Arc<dyn JobQueue>,
    pub ledger: IncidentLedger,
    pub pipeline: CheckPipeline,
    pub service: MonitorService,
}

impl Engine {
    /// Connect the storage and queue backends named by `config`
    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        let store = config::connect_storage(&config.storage).await?;
        let queue = config::connect_queue(&config.queue).await?;
        Ok(Self::new(config, store, queue))
    }

    pub fn new(config: &Config, store: Arc<dyn StorageBackend>, queue: Arc<dyn JobQueue>) -> Self {
        let notifier = config::build_notifier(config.alert.as_ref());
        let ledger = IncidentLedger::new(store.clone(), notifier);
        let pipeline = CheckPipeline::new(store.clone(), ledger.clone(), EndpointChecker::default())
            .with_latency_cap(config.latency_samples);
        let orchestrator = FallbackOrchestrator::new(queue.clone(), pipeline.clone(), config.fallback.options());
        let service = MonitorService::new(store.clone(), ledger.clone(), orchestrator)
            .with_default_timeout_ms(config.default_timeout_ms);

        Self {
            store,
            queue,
            ledger,
            pipeline,
            service,
        }
    }
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
