//! Coordinator binary

use clap::{Parser, Subcommand};
use fansum::common::{Config, SpawnMode};
use fansum::Coordinator;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "fansum-coord")]
#[command(about = "fansum coordinator: HTTP API, message broker and worker supervisor")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the coordinator and its workers
    Serve {
        /// Number of workers to start
        #[arg(long)]
        workers: Option<usize>,

        /// Bind address for HTTP
        #[arg(long)]
        http: Option<SocketAddr>,

        /// Bind address for the broker
        #[arg(long)]
        broker: Option<SocketAddr>,

        /// Shared data directory for the worker logs
        #[arg(long)]
        data: Option<PathBuf>,

        /// Sum aggregation window in milliseconds
        #[arg(long)]
        window_ms: Option<u64>,

        /// Run workers as tasks instead of child processes
        #[arg(long)]
        embedded: bool,

        /// Worker executable (defaults to fansum-worker next to this binary)
        #[arg(long)]
        worker_bin: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Config file and environment first, then CLI overrides
    let config = Config::load()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            workers,
            http,
            broker,
            data,
            window_ms,
            embedded,
            worker_bin,
        } => {
            let mut coord_config = config.coordinator;
            if let Some(workers) = workers {
                coord_config.workers = workers;
            }
            if let Some(http) = http {
                coord_config.http_addr = http;
            }
            if let Some(broker) = broker {
                coord_config.broker_addr = broker;
            }
            if let Some(data) = data {
                coord_config.data_dir = data;
            }
            if let Some(window_ms) = window_ms {
                coord_config.sum_timeout_ms = window_ms;
            }
            if embedded {
                coord_config.spawn_mode = SpawnMode::Embedded;
            }
            if worker_bin.is_some() {
                coord_config.worker_bin = worker_bin;
            }

            let coord = Coordinator::new(coord_config);
            coord.serve().await?;
        }
    }

    Ok(())
}
