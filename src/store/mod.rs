//! Number storage
//!
//! Workers persist every consumed write here and answer sum requests from
//! it; the HTTP stats endpoint reads it directly.

pub mod log;
pub mod memory;

pub use log::LogStore;
pub use memory::MemoryStore;

use crate::common::{Error, PersistedNumber, Result, WorkerCount, WorkerId};

/// Storage backend shared by workers and the stats endpoint.
///
/// Implementations must accept concurrent calls for distinct worker ids.
pub trait NumberStore: Send + Sync {
    /// Store `value` attributed to `worker_id`
    fn persist(&self, worker_id: WorkerId, value: i64) -> Result<PersistedNumber>;

    /// Sum of every value stored for `worker_id` (0 when none)
    fn sum_for(&self, worker_id: WorkerId) -> Result<i64>;

    /// Stored item count per worker, ordered by worker id. Workers with no
    /// items are omitted.
    fn counts_by_worker(&self) -> Result<Vec<WorkerCount>>;
}

/// Run a storage call off the async executor.
pub async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("storage task failed: {}", e)))?
}
