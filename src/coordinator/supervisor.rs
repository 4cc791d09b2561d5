//! Worker supervision
//!
//! Starts exactly `workers` workers with ids `1..=N`, either as child
//! processes connecting back over the broker's TCP port or as tasks on the
//! in-process broker. Exits are logged; workers are not restarted.

use crate::broker::Connection;
use crate::common::{CoordinatorConfig, Error, Result, WorkerId};
use crate::store::NumberStore;
use crate::worker::{WorkerHandle, WorkerNode};
use futures_util::future::join_all;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::task::JoinHandle;

/// Worker executable name
pub const WORKER_BIN: &str = "fansum-worker";

enum Slot {
    /// Owns the child; aborting it drops the child, which kills it
    Process { id: WorkerId, monitor: JoinHandle<()> },
    Embedded(WorkerHandle),
}

/// The set of workers started by the coordinator
pub struct Supervisor {
    slots: Vec<Slot>,
}

fn worker_ids(count: usize) -> Result<Vec<WorkerId>> {
    (1..=count)
        .map(|i| {
            let id = u32::try_from(i)
                .map_err(|_| Error::InvalidConfig(format!("too many workers: {}", count)))?;
            WorkerId::new(id)
        })
        .collect()
}

/// Default worker binary: next to the running executable
pub fn default_worker_bin() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| Error::Internal("executable has no parent directory".into()))?;
    Ok(dir.join(format!("{}{}", WORKER_BIN, std::env::consts::EXE_SUFFIX)))
}

impl Supervisor {
    /// Spawn one `fansum-worker` process per worker id.
    pub fn spawn_processes(config: &CoordinatorConfig, broker_addr: SocketAddr) -> Result<Self> {
        let bin = match &config.worker_bin {
            Some(bin) => bin.clone(),
            None => default_worker_bin()?,
        };

        let mut slots = Vec::with_capacity(config.workers);
        for id in worker_ids(config.workers)? {
            let mut child = Command::new(&bin)
                .arg("--id")
                .arg(id.to_string())
                .arg("--broker")
                .arg(broker_addr.to_string())
                .arg("--data-dir")
                .arg(&config.data_dir)
                .env("FANSUM__WORKER__SYNC_POLICY", config.sync_policy.as_str())
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| {
                    Error::Internal(format!("failed to spawn {}: {}", bin.display(), e))
                })?;

            tracing::info!(worker_id = %id, pid = child.id(), "worker process started");
            let monitor = tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) => tracing::error!(worker_id = %id, %status, "worker process exited"),
                    Err(e) => tracing::error!(worker_id = %id, "failed to wait for worker: {}", e),
                }
            });
            slots.push(Slot::Process { id, monitor });
        }
        Ok(Self { slots })
    }

    /// Run the workers as tasks sharing `connection` and `store`.
    pub async fn start_embedded(
        count: usize,
        connection: &Connection,
        store: Arc<dyn NumberStore>,
    ) -> Result<Self> {
        let mut slots = Vec::with_capacity(count);
        for id in worker_ids(count)? {
            let handle = WorkerNode::new(id, connection.clone(), store.clone())
                .start()
                .await?;
            slots.push(Slot::Embedded(handle));
        }
        tracing::info!(workers = count, "embedded workers started");
        Ok(Self { slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn ids(&self) -> Vec<WorkerId> {
        self.slots
            .iter()
            .map(|slot| match slot {
                Slot::Process { id, .. } => *id,
                Slot::Embedded(handle) => handle.id(),
            })
            .collect()
    }

    /// Workers whose process or flows have stopped
    pub fn exited(&self) -> Vec<WorkerId> {
        self.slots
            .iter()
            .filter_map(|slot| match slot {
                Slot::Process { id, monitor } => monitor.is_finished().then_some(*id),
                Slot::Embedded(handle) => handle.is_finished().then_some(handle.id()),
            })
            .collect()
    }

    /// Stop every worker and wait until all of them are gone
    pub async fn shutdown(self) {
        let stops = self.slots.into_iter().map(|slot| async move {
            match slot {
                Slot::Process { id, monitor } => {
                    monitor.abort();
                    let _ = monitor.await;
                    tracing::info!(worker_id = %id, "worker process stopped");
                }
                Slot::Embedded(handle) => {
                    let id = handle.id();
                    handle.abort();
                    let _ = handle.join().await;
                    tracing::info!(worker_id = %id, "embedded worker stopped");
                }
            }
        });
        join_all(stops).await;
    }
}
