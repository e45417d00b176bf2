use std::path::PathBuf;

use clap::Parser;
use endpoint_monitoring::{
    Engine,
    config,
    scheduler::{Scheduler, SchedulerHandle},
    shutdown_signal,
    worker::WorkerHandle,
};
use tracing::{error, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: Option<PathBuf>,

    /// Also run the scheduler in this process
    #[arg(long)]
    with_scheduler: bool,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("endpoint_monitoring", LevelFilter::DEBUG),
        ("beacon_worker", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = config::load(args.file.as_deref())?;
    let options = config.worker.options();

    let store = config::connect_storage(&config.storage).await?;
    let queue = tokio::select! {
        queue = config::connect_queue_retrying(&config.queue, options.backend_retry_delay) => queue,
        _ = shutdown_signal() => {
            store.close().await?;
            return Ok(());
        }
    };
    let engine = Engine::new(&config, store, queue);

    info!("starting worker pool with concurrency {}", options.concurrency);
    let worker = WorkerHandle::spawn(engine.queue.clone(), engine.pipeline.clone(), options);

    let scheduler = args.with_scheduler.then(|| {
        info!("running embedded scheduler every {:?}", config.scheduler.tick());
        SchedulerHandle::spawn(
            Scheduler::new(engine.store.clone(), engine.queue.clone()),
            config.scheduler.tick(),
        )
    });

    shutdown_signal().await;

    if let Some(scheduler) = scheduler {
        scheduler.shutdown().await;
    }

    info!("draining in-flight jobs");
    match worker.shutdown().await {
        Ok(stats) => info!(
            "worker stopped: {} completed, {} retried, {} failed",
            stats.completed, stats.retried, stats.failed
        ),
        Err(e) => error!("worker did not shut down cleanly: {e}"),
    }

    engine.store.close().await?;
    Ok(())
}
