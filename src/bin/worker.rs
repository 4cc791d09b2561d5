//! Worker binary

use clap::Parser;
use fansum::broker::Connection;
use fansum::common::utils::retry_with_backoff;
use fansum::common::Config;
use fansum::store::{LogStore, NumberStore};
use fansum::WorkerNode;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// The coordinator spawns workers while its broker may still be binding
const CONNECT_ATTEMPTS: usize = 8;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "fansum-worker")]
#[command(about = "fansum worker: stores queued writes and answers sum broadcasts")]
#[command(version)]
struct Cli {
    /// Worker id (>= 1)
    #[arg(long)]
    id: Option<u32>,

    /// Broker address (host:port)
    #[arg(long)]
    broker: Option<String>,

    /// Shared data directory for the worker logs
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut worker_config = config.worker;
    if cli.id.is_some() {
        worker_config.worker_id = cli.id;
    }
    if let Some(broker) = cli.broker {
        worker_config.broker_addr = broker;
    }
    if let Some(data_dir) = cli.data_dir {
        worker_config.data_dir = data_dir;
    }

    // Refuse to start without an identity, before touching broker or disk
    let worker_id = match worker_config.validate() {
        Ok(id) => id,
        Err(e) => {
            tracing::error!("refusing to start: {}", e);
            return Err(e.into());
        }
    };

    tracing::info!("Starting worker {}", worker_id);
    tracing::info!("  Broker: {}", worker_config.broker_addr);
    tracing::info!("  Data dir: {}", worker_config.data_dir.display());

    let store: Arc<dyn NumberStore> = Arc::new(LogStore::open(
        &worker_config.data_dir,
        worker_config.sync_policy,
    )?);
    let broker_addr = worker_config.broker_addr.as_str();
    let connection = retry_with_backoff(
        || Connection::connect(broker_addr),
        CONNECT_ATTEMPTS,
        CONNECT_BACKOFF,
    )
    .await?;

    WorkerNode::new(worker_id, connection, store).serve().await?;
    Ok(())
}
