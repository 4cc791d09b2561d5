//! CLI for a running coordinator

use clap::{Parser, Subcommand};
use fansum::ops::ApiClient;

#[derive(Parser)]
#[command(name = "fansum")]
#[command(about = "fansum command-line client")]
#[command(version)]
struct Cli {
    /// Coordinator URL
    #[arg(long, env = "FANSUM_URL", default_value = "http://localhost:3000")]
    coordinator: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a value for storage
    Write {
        /// Integer value
        #[arg(allow_hyphen_values = true)]
        value: i64,
    },

    /// Sum every live worker's values
    Sum,

    /// Stored item count per worker
    Stats,

    /// Coordinator health
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = ApiClient::new(&cli.coordinator)?;

    match cli.command {
        Commands::Write { value } => {
            let response = client.write(value).await?;
            println!("Queued {}", response.value);
        }

        Commands::Sum => {
            let response = client.sum().await?;
            println!("Sum report:");
            println!("  Total: {}", response.total);
            println!("  Workers responded: {}", response.responded_count);
            println!("  Window: {} ms", response.window_ms);
        }

        Commands::Stats => {
            let response = client.stats().await?;
            println!("Items per worker:");
            if response.workers.is_empty() {
                println!("  (none)");
            }
            for row in response.workers {
                println!("  worker {}: {}", row.worker_id, row.items);
            }
        }

        Commands::Health => {
            let health = client.health().await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
    }

    Ok(())
}
