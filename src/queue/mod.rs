//! Typed wrappers over broker channels
//!
//! - [`WorkQueue`] / [`WorkConsumer`]: the durable `writes.q` queue
//! - [`Fanout`] / [`FanoutReceiver`]: the `sum.fanout` broadcast exchange
//! - [`ReplyInbox`]: a coordinator's private reply address

pub mod fanout;
pub mod reply;
pub mod work;

pub use fanout::{Fanout, FanoutReceiver};
pub use reply::{send_reply, ReplyInbox};
pub use work::{WorkConsumer, WorkQueue};

use crate::broker::{Channel, Delivery, QueueOptions};
use crate::common::{Result, SUM_EXCHANGE, WRITES_QUEUE};

/// Declare the write queue and the sum exchange.
///
/// Idempotent; `max_queue_len` only applies to whoever declares the queue
/// first.
pub async fn declare_topology(channel: &Channel, max_queue_len: Option<usize>) -> Result<()> {
    channel
        .declare_queue(
            WRITES_QUEUE,
            QueueOptions::durable().with_max_length(max_queue_len),
        )
        .await?;
    channel.declare_fanout(SUM_EXCHANGE).await?;
    Ok(())
}

/// A delivery together with the channel that must settle it
pub struct Envelope {
    delivery: Delivery,
    channel: Channel,
}

impl Envelope {
    pub(crate) fn new(delivery: Delivery, channel: Channel) -> Self {
        Self { delivery, channel }
    }

    pub fn body(&self) -> &[u8] {
        &self.delivery.body
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    pub fn redelivered(&self) -> bool {
        self.delivery.redelivered
    }

    pub async fn ack(self) -> Result<()> {
        self.channel.ack(self.delivery.delivery_tag).await
    }

    /// Drop the message for good
    pub async fn reject(self) -> Result<()> {
        self.channel.nack(self.delivery.delivery_tag, false).await
    }
}
