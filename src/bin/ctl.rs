use std::path::PathBuf;

use clap::{Parser, Subcommand};
use endpoint_monitoring::{
    Engine, config,
    model::{IncidentId, MonitorId, NewMonitor},
    stats::sla_report,
};
use serde::Serialize;
use serde_json::json;
use tracing::{level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Create a monitor and dispatch its first check
    Create {
        url: String,

        #[arg(long)]
        name: Option<String>,

        /// Check interval in minutes (1, 5 or 10)
        #[arg(long, default_value_t = 5)]
        interval: u8,

        /// Request timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Check a monitor now
    RunNow { id: MonitorId },

    /// Pause an active monitor or resume a paused one
    Pause { id: MonitorId },

    /// Resolve an open incident by hand
    Resolve { id: IncidentId },

    /// Dashboard numbers and queue counts
    Status,

    /// All monitors with their SLA status
    Monitors,

    /// Latest incidents, optionally of a single monitor
    Incidents {
        #[arg(long)]
        monitor: Option<MonitorId>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("endpoint_monitoring", LevelFilter::INFO),
        ("beacon_ctl", LevelFilter::TRACE),
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

fn print(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = config::load(args.file.as_deref())?;
    let engine = Engine::connect(&config).await?;
    let service = &engine.service;

    match args.command {
        Command::Create {
            url,
            name,
            interval,
            timeout_ms,
        } => {
            let created = service
                .create_monitor(NewMonitor {
                    name,
                    url,
                    interval_minutes: interval,
                    timeout_ms,
                })
                .await?;
            print(&created)?;
        }
        Command::RunNow { id } => match service.run_now(id).await? {
            Some(outcome) => print(&json!({ "monitor_id": id, "outcome": outcome }))?,
            None => anyhow::bail!("monitor {id} not found"),
        },
        Command::Pause { id } => match service.pause_or_resume(id).await? {
            Some(monitor) => print(&monitor)?,
            None => anyhow::bail!("monitor {id} not found"),
        },
        Command::Resolve { id } => match service.resolve_incident(id).await? {
            Some(incident) => print(&incident)?,
            None => anyhow::bail!("incident {id} not found or already resolved"),
        },
        Command::Status => {
            let dashboard = service.dashboard().await?;
            let queue = engine.queue.counts().await?;
            let storage = engine.store.health_check().await?;
            print(&json!({
                "dashboard": dashboard,
                "queue": queue,
                "storage": { "healthy": storage.healthy, "message": storage.message },
            }))?;
        }
        Command::Monitors => {
            let monitors: Vec<_> = service
                .monitors()
                .await?
                .into_iter()
                .map(|monitor| {
                    let sla: Vec<_> = sla_report(&monitor)
                        .into_iter()
                        .map(|(target, status)| json!({ "target": target.to_string(), "status": status }))
                        .collect();
                    json!({ "monitor": monitor, "sla": sla })
                })
                .collect();
            print(&monitors)?;
        }
        Command::Incidents { monitor, limit } => {
            let incidents = match monitor {
                Some(id) => service.monitor_incidents(id, limit).await?,
                None => service.incidents(limit).await?,
            };
            print(&incidents)?;
        }
    }

    engine.store.close().await?;
    Ok(())
}
