//! Write flow: `writes.q` -> storage
//!
//! One message at a time (prefetch 1). A write is acknowledged only after it
//! has been persisted; malformed bodies and storage failures are rejected
//! without requeue so a poison message cannot loop.

use crate::common::{Error, Result, WorkerId, WriteRequest};
use crate::queue::{Envelope, WorkConsumer};
use crate::store::{run_blocking, NumberStore};
use std::sync::Arc;

/// What happened to one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Stored { id: u64, value: i64 },
    Malformed,
    StorageFailed,
}

/// Consume writes until the consumer ends or the broker link breaks.
pub async fn run_write_loop(
    worker_id: WorkerId,
    mut consumer: WorkConsumer,
    store: Arc<dyn NumberStore>,
) -> Result<()> {
    tracing::info!("write consumer started");
    while let Some(envelope) = consumer.next().await {
        match handle_write(worker_id, &store, envelope).await {
            Err(e) if e.is_transport_fault() => return Err(e),
            Err(e) => tracing::warn!("write left unsettled: {}", e),
            Ok(_) => {}
        }
    }
    tracing::warn!("write consumer ended");
    Err(Error::ConnectionClosed)
}

/// Persist then ack, or reject. Only a failed ack/nack is an error.
pub async fn handle_write(
    worker_id: WorkerId,
    store: &Arc<dyn NumberStore>,
    envelope: Envelope,
) -> Result<WriteOutcome> {
    if envelope.redelivered() {
        tracing::debug!("processing redelivered write");
    }

    let request = match WriteRequest::decode(envelope.body()) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("rejecting write: {}", e);
            envelope.reject().await?;
            return Ok(WriteOutcome::Malformed);
        }
    };

    let persisted = {
        let store = store.clone();
        run_blocking(move || store.persist(worker_id, request.value)).await
    };

    match persisted {
        Ok(record) => {
            envelope.ack().await?;
            tracing::info!(id = record.id, value = record.value, "stored write");
            Ok(WriteOutcome::Stored {
                id: record.id,
                value: record.value,
            })
        }
        Err(e) => {
            tracing::error!(value = request.value, "failed to store write: {}", e);
            envelope.reject().await?;
            Ok(WriteOutcome::StorageFailed)
        }
    }
}
