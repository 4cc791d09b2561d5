//! Common utilities and types shared across fansum

pub mod config;
pub mod error;
pub mod message;
pub mod utils;

pub use config::{Config, CoordinatorConfig, SpawnMode, SyncPolicy, WorkerConfig};
pub use error::{Error, RemoteError, Result};
pub use message::{
    AggregateResult, PersistedNumber, SumReply, SumRequest, WorkerCount, WorkerId, WriteRequest,
    CONTENT_TYPE_JSON, SUM_EXCHANGE, WRITES_QUEUE,
};
pub use utils::{crc32, generate_correlation_token, parse_integer_value, timestamp_now_millis};
