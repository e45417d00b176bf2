use std::path::PathBuf;

use clap::Parser;
use endpoint_monitoring::{
    config,
    scheduler::{Scheduler, SchedulerHandle},
    shutdown_signal,
};
use tracing::{info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: Option<PathBuf>,

    /// Run a single tick and exit
    #[arg(long)]
    once: bool,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("endpoint_monitoring", LevelFilter::DEBUG),
        ("beacon_scheduler", LevelFilter::TRACE),
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
    let store = config::connect_storage(&config.storage).await?;
    let queue = config::connect_queue(&config.queue).await?;
    let scheduler = Scheduler::new(store.clone(), queue);

    if args.once {
        match scheduler.tick().await {
            Some(summary) => info!("tick finished: {summary:?}"),
            None => anyhow::bail!("monitor store unavailable"),
        }
    } else {
        let tick = config.scheduler.tick();
        info!("scheduling due monitors every {tick:?}");
        let handle = SchedulerHandle::spawn(scheduler, tick);

        shutdown_signal().await;
        handle.shutdown().await;
    }

    store.close().await?;
    Ok(())
}
