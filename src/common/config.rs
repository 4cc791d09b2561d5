//! Configuration for fansum components
//!
//! Values are layered: built-in defaults, then an optional TOML file
//! (`FANSUM_CONFIG`, or `./fansum.toml`), then `FANSUM__SECTION__FIELD`
//! environment variables, then the legacy variables the deployment scripts
//! still export (`SLAVES`, `SUM_TIMEOUT_MS`, `PORT`, `SLAVE_ID`).
//! Command-line flags are applied on top by the binaries.

use crate::common::{Error, Result, WorkerId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "fansum.toml";

/// Global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Coordinator-specific config
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Worker-specific config
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// How the record log reaches the disk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    /// fsync after every record
    #[default]
    Always,
    /// hand each record to the OS, fsync on shutdown
    Flush,
    /// never fsync
    Never,
}

impl SyncPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPolicy::Always => "always",
            SyncPolicy::Flush => "flush",
            SyncPolicy::Never => "never",
        }
    }
}

/// How the coordinator starts its workers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpawnMode {
    /// One `fansum-worker` child process per worker
    #[default]
    Process,
    /// Workers run as tasks inside the coordinator process
    Embedded,
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Bind address for the HTTP API
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Bind address for the broker wire protocol
    #[serde(default = "default_broker_bind")]
    pub broker_addr: SocketAddr,

    /// Number of workers to start
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Aggregation window for sum requests
    #[serde(default = "default_sum_timeout")]
    pub sum_timeout_ms: u64,

    /// Shared directory holding the per-worker record logs
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub spawn_mode: SpawnMode,

    /// Worker executable; defaults to `fansum-worker` next to the current binary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_bin: Option<PathBuf>,

    /// Ready-message limit of the write queue before publishes are rejected
    #[serde(default = "default_max_queue_len")]
    pub max_queue_len: Option<usize>,

    #[serde(default)]
    pub sync_policy: SyncPolicy,
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}
fn default_broker_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5673))
}
fn default_workers() -> usize {
    3
}
fn default_sum_timeout() -> u64 {
    1500
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_max_queue_len() -> Option<usize> {
    Some(100_000)
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            broker_addr: default_broker_bind(),
            workers: default_workers(),
            sum_timeout_ms: default_sum_timeout(),
            data_dir: default_data_dir(),
            spawn_mode: SpawnMode::default(),
            worker_bin: None,
            max_queue_len: default_max_queue_len(),
            sync_policy: SyncPolicy::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn sum_timeout(&self) -> Duration {
        Duration::from_millis(self.sum_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sum_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "sum_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.max_queue_len == Some(0) {
            return Err(Error::InvalidConfig(
                "max_queue_len must be greater than zero when set".into(),
            ));
        }
        Ok(())
    }
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker identity; a worker without one refuses to start
    #[serde(default)]
    pub worker_id: Option<u32>,

    /// Broker address (host:port)
    #[serde(default = "default_broker_addr")]
    pub broker_addr: String,

    /// Shared directory holding the per-worker record logs
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub sync_policy: SyncPolicy,
}

fn default_broker_addr() -> String {
    default_broker_bind().to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            broker_addr: default_broker_addr(),
            data_dir: default_data_dir(),
            sync_policy: SyncPolicy::default(),
        }
    }
}

impl WorkerConfig {
    /// Check the identity before anything touches the broker or the disk.
    pub fn validate(&self) -> Result<WorkerId> {
        match self.worker_id {
            None => Err(Error::InvalidConfig(
                "worker id is not set (use --id, SLAVE_ID or FANSUM__WORKER__WORKER_ID)".into(),
            )),
            Some(id) => WorkerId::new(id),
        }
    }
}

impl Config {
    /// Load configuration from `FANSUM_CONFIG` (or `./fansum.toml`) and the environment.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os("FANSUM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        Self::load_from(&path)
    }

    /// Load configuration with an explicit file path; a missing file is not an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        let port = std::env::var("PORT")
            .ok()
            .map(|port| format!("0.0.0.0:{}", port.trim()));

        let settings = config::Config::builder()
            .add_source(
                config::File::from(path.to_path_buf())
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix("FANSUM")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("coordinator.workers", std::env::var("SLAVES").ok())?
            .set_override_option(
                "coordinator.sum_timeout_ms",
                std::env::var("SUM_TIMEOUT_MS").ok(),
            )?
            .set_override_option("coordinator.http_addr", port)?
            .set_override_option("worker.worker_id", std::env::var("SLAVE_ID").ok())?
            .build()?;

        // Each binary validates the section it runs with
        let config: Config = settings.try_deserialize()?;
        Ok(config)
    }
}
