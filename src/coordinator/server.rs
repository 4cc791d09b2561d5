//! Coordinator server

use crate::broker::{Broker, BrokerServer, Connection};
use crate::common::{CoordinatorConfig, Result, SpawnMode};
use crate::coordinator::aggregate::SumCoordinator;
use crate::coordinator::http::{create_router, CoordState};
use crate::coordinator::supervisor::Supervisor;
use crate::queue::{declare_topology, WorkQueue};
use crate::store::{LogStore, NumberStore};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const WORKER_WATCH_INTERVAL: Duration = Duration::from_secs(5);

pub struct Coordinator {
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self { config }
    }

    pub async fn serve(self) -> Result<()> {
        self.config.validate()?;

        tracing::info!("Starting coordinator");
        tracing::info!("  HTTP API: {}", self.config.http_addr);
        tracing::info!("  Broker: {}", self.config.broker_addr);
        tracing::info!("  Workers: {} ({:?})", self.config.workers, self.config.spawn_mode);
        tracing::info!("  Sum window: {} ms", self.config.sum_timeout_ms);
        tracing::info!("  Data dir: {}", self.config.data_dir.display());

        // Broker and topology
        let broker = Arc::new(Broker::new());
        let connection = Connection::local(broker.clone());
        let setup = connection.create_channel().await?;
        declare_topology(&setup, self.config.max_queue_len).await?;
        setup.close().await?;

        let broker_server = BrokerServer::bind(self.config.broker_addr, broker.clone()).await?;
        let broker_addr = broker_server.local_addr()?;

        // Storage
        let store: Arc<dyn NumberStore> = Arc::new(LogStore::open(
            &self.config.data_dir,
            self.config.sync_policy,
        )?);

        // Workers
        let supervisor = match self.config.spawn_mode {
            SpawnMode::Process => Supervisor::spawn_processes(&self.config, broker_addr)?,
            SpawnMode::Embedded => {
                Supervisor::start_embedded(self.config.workers, &connection, store.clone())
                    .await?
            }
        };
        tracing::info!(workers = ?supervisor.ids(), "workers started");

        // HTTP server
        let http_state = CoordState {
            work_queue: WorkQueue::new(connection.create_channel().await?),
            sums: SumCoordinator::new(connection.clone()),
            store,
            sum_window: self.config.sum_timeout(),
            workers: self.config.workers,
        };
        let http_router = create_router(http_state);
        let http_listener = tokio::net::TcpListener::bind(self.config.http_addr).await?;
        let http_server = axum::serve(http_listener, http_router);

        tracing::info!("✓ Coordinator ready");

        tokio::select! {
            res = http_server => {
                if let Err(e) = res {
                    tracing::error!("HTTP server error: {}", e);
                }
            }
            res = broker_server.serve() => {
                if let Err(e) = res {
                    tracing::error!("Broker server error: {}", e);
                }
            }
            _ = watch_workers(&supervisor) => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown requested");
            }
        }

        supervisor.shutdown().await;
        Ok(())
    }
}

/// Report workers whose process or flows stop. Never returns.
async fn watch_workers(supervisor: &Supervisor) {
    let mut reported = HashSet::new();
    let mut tick = tokio::time::interval(WORKER_WATCH_INTERVAL);
    loop {
        tick.tick().await;
        for id in supervisor.exited() {
            if reported.insert(id) {
                tracing::warn!(worker_id = %id, "worker stopped; its sums drop out of aggregates");
            }
        }
    }
}
