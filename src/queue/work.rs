//! Durable write queue

use crate::broker::{Channel, Consumer, Properties};
use crate::common::{Result, WriteRequest, CONTENT_TYPE_JSON, WRITES_QUEUE};
use crate::queue::Envelope;

/// Producer side of `writes.q`
#[derive(Debug, Clone)]
pub struct WorkQueue {
    channel: Channel,
}

impl WorkQueue {
    /// Wrap a channel dedicated to publishing writes. The queue must
    /// already be declared.
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    /// Publish one write as a persistent JSON message.
    ///
    /// Fails with `Backpressure` when the queue is at its length limit.
    pub async fn enqueue(&self, request: WriteRequest) -> Result<()> {
        let properties = Properties {
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            persistent: true,
            ..Default::default()
        };
        self.channel
            .publish("", WRITES_QUEUE, properties, request.encode()?)
            .await
    }
}

/// Consumer side of `writes.q`, one message in flight at a time
pub struct WorkConsumer {
    channel: Channel,
    consumer: Consumer,
}

impl WorkConsumer {
    pub async fn open(channel: Channel) -> Result<Self> {
        channel.qos(1).await?;
        let consumer = channel.consume(WRITES_QUEUE, false).await?;
        Ok(Self { channel, consumer })
    }

    /// Next write to process; `None` once the consumer is gone.
    pub async fn next(&mut self) -> Option<Envelope> {
        let delivery = self.consumer.recv().await?;
        Some(Envelope::new(delivery, self.channel.clone()))
    }
}
