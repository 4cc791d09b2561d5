//! Worker node lifecycle

use crate::broker::Connection;
use crate::common::{Error, Result, WorkerId};
use crate::queue::{declare_topology, FanoutReceiver, WorkConsumer};
use crate::store::NumberStore;
use crate::worker::sums::run_sum_loop;
use crate::worker::writes::run_write_loop;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::Instrument;

pub struct WorkerNode {
    id: WorkerId,
    connection: Connection,
    store: Arc<dyn NumberStore>,
}

impl WorkerNode {
    pub fn new(id: WorkerId, connection: Connection, store: Arc<dyn NumberStore>) -> Self {
        Self {
            id,
            connection,
            store,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Bind the write consumer and the sum receiver, then run both flows in
    /// the background. Once this returns the worker is receiving broadcasts.
    pub async fn start(self) -> Result<WorkerHandle> {
        let span = tracing::info_span!("worker", worker_id = %self.id);
        let id = self.id;

        let (consumer, receiver, reply_channel) = async {
            let setup = self.connection.create_channel().await?;
            declare_topology(&setup, None).await?;
            setup.close().await?;

            let consumer = WorkConsumer::open(self.connection.create_channel().await?).await?;
            let receiver =
                FanoutReceiver::bind_ephemeral(self.connection.create_channel().await?).await?;
            let reply_channel = self.connection.create_channel().await?;
            Ok::<_, Error>((consumer, receiver, reply_channel))
        }
        .instrument(span.clone())
        .await?;

        let writes = tokio::spawn(
            run_write_loop(id, consumer, self.store.clone()).instrument(span.clone()),
        );
        let sums = tokio::spawn(
            run_sum_loop(id, receiver, reply_channel, self.store).instrument(span.clone()),
        );

        span.in_scope(|| tracing::info!("worker ready"));
        Ok(WorkerHandle { id, writes, sums })
    }

    /// Run until either flow stops.
    pub async fn serve(self) -> Result<()> {
        self.start().await?.join().await
    }
}

/// Running worker flows. Dropping the handle stops them.
pub struct WorkerHandle {
    id: WorkerId,
    writes: JoinHandle<Result<()>>,
    sums: JoinHandle<Result<()>>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.writes.is_finished() || self.sums.is_finished()
    }

    /// Wait for the first flow to stop, then stop the other one.
    pub async fn join(mut self) -> Result<()> {
        let (result, other) = tokio::select! {
            res = &mut self.writes => (res, &mut self.sums),
            res = &mut self.sums => (res, &mut self.writes),
        };
        other.abort();
        let _ = other.await;

        match result {
            Ok(res) => res,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(Error::Internal(format!("worker {} panicked: {}", self.id, e))),
        }
    }

    /// Stop both flows immediately. In-flight deliveries are not settled, so
    /// the broker hands them to another worker.
    pub fn abort(&self) {
        tracing::warn!(worker_id = %self.id, "aborting worker");
        self.writes.abort();
        self.sums.abort();
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.writes.abort();
        self.sums.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::common::{WriteRequest, WRITES_QUEUE};
    use crate::queue::WorkQueue;
    use crate::store::MemoryStore;
    use std::time::Duration;

    #[tokio::test]
    async fn test_worker_stores_queued_writes() {
        let broker = Arc::new(Broker::new());
        let conn = Connection::local(broker.clone());
        let memory = Arc::new(MemoryStore::new());
        let id = WorkerId::new(1).unwrap();

        let handle = WorkerNode::new(id, conn.clone(), memory.clone())
            .start()
            .await
            .unwrap();
        assert_eq!(broker.consumer_count(WRITES_QUEUE), 1);

        let queue = WorkQueue::new(conn.create_channel().await.unwrap());
        for value in [1, 2, 3] {
            queue.enqueue(WriteRequest { value }).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while memory.len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(memory.sum_for(id).unwrap(), 6);

        handle.abort();
        assert!(handle.join().await.is_ok());
    }

    #[tokio::test]
    async fn test_abort_releases_broker_resources() {
        let broker = Arc::new(Broker::new());
        let conn = Connection::local(broker.clone());
        let handle = WorkerNode::new(
            WorkerId::new(2).unwrap(),
            conn,
            Arc::new(MemoryStore::new()),
        )
        .start()
        .await
        .unwrap();

        handle.abort();
        handle.join().await.unwrap();
        assert_eq!(broker.consumer_count(WRITES_QUEUE), 0);
    }
}
