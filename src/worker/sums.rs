//! Sum flow: `sum.fanout` -> partial sum -> direct reply

use crate::broker::Channel;
use crate::common::{Error, Result, SumReply, SumRequest, WorkerId};
use crate::queue::{send_reply, Envelope, FanoutReceiver};
use crate::store::{run_blocking, NumberStore};
use std::sync::Arc;

/// Answer sum requests until the receiver ends or an ack fails.
///
/// `reply_channel` is only used to publish replies.
pub async fn run_sum_loop(
    worker_id: WorkerId,
    mut receiver: FanoutReceiver,
    reply_channel: Channel,
    store: Arc<dyn NumberStore>,
) -> Result<()> {
    tracing::info!(queue = %receiver.address(), "sum receiver bound");
    while let Some(envelope) = receiver.next().await {
        match handle_sum_request(worker_id, &store, &reply_channel, envelope).await {
            Err(e) if e.is_transport_fault() => return Err(e),
            Err(e) => tracing::warn!("sum request left unacknowledged: {}", e),
            Ok(_) => {}
        }
    }
    tracing::warn!("sum receiver ended");
    Err(Error::ConnectionClosed)
}

/// Reply with this worker's partial sum. The request is acknowledged
/// whatever happens; a failed reply is only logged.
pub async fn handle_sum_request(
    worker_id: WorkerId,
    store: &Arc<dyn NumberStore>,
    reply_channel: &Channel,
    envelope: Envelope,
) -> Result<Option<SumReply>> {
    let reply = answer(worker_id, store, reply_channel, envelope.body()).await;
    envelope.ack().await?;
    Ok(reply)
}

async fn answer(
    worker_id: WorkerId,
    store: &Arc<dyn NumberStore>,
    reply_channel: &Channel,
    body: &[u8],
) -> Option<SumReply> {
    let request = match SumRequest::decode(body) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("ignoring sum request: {}", e);
            return None;
        }
    };

    let partial = {
        let store = store.clone();
        run_blocking(move || store.sum_for(worker_id)).await
    };
    let partial_sum = match partial {
        Ok(sum) => sum,
        Err(e) => {
            tracing::error!(token = %request.correlation_token, "partial sum failed: {}", e);
            return None;
        }
    };

    let reply = SumReply {
        worker_id,
        partial_sum,
        correlation_token: request.correlation_token,
    };
    match send_reply(reply_channel, &request.reply_address, &reply).await {
        Ok(()) => {
            tracing::debug!(token = %reply.correlation_token, partial_sum, "sum reply sent");
            Some(reply)
        }
        Err(e) => {
            tracing::warn!(token = %reply.correlation_token, "sum reply not sent: {}", e);
            None
        }
    }
}
