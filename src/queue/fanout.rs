//! Sum-request broadcast
//!
//! Nothing stores a broadcast for receivers that are not bound at publish
//! time: a sum only covers the workers alive at that moment.

use crate::broker::{Channel, Consumer, Properties, QueueOptions};
use crate::common::{Result, SumRequest, CONTENT_TYPE_JSON, SUM_EXCHANGE};
use crate::queue::Envelope;

/// Publisher side of `sum.fanout`
#[derive(Debug, Clone)]
pub struct Fanout {
    channel: Channel,
}

impl Fanout {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    /// Send a request to every bound receiver. The token and reply address
    /// are mirrored into the message properties.
    pub async fn broadcast(&self, request: &SumRequest) -> Result<()> {
        let properties = Properties {
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            correlation_id: Some(request.correlation_token.clone()),
            reply_to: Some(request.reply_address.clone()),
            persistent: false,
        };
        self.channel
            .publish(SUM_EXCHANGE, "", properties, request.encode()?)
            .await
    }
}

/// A worker's private queue bound to `sum.fanout`
pub struct FanoutReceiver {
    address: String,
    channel: Channel,
    consumer: Consumer,
}

impl FanoutReceiver {
    /// Declare an exclusive auto-delete queue, bind it and start consuming.
    /// The queue lives as long as `channel`.
    pub async fn bind_ephemeral(channel: Channel) -> Result<Self> {
        channel.declare_fanout(SUM_EXCHANGE).await?;
        let address = channel.declare_queue("", QueueOptions::ephemeral()).await?;
        channel.bind_queue(&address, SUM_EXCHANGE).await?;
        let consumer = channel.consume(&address, false).await?;
        Ok(Self {
            address,
            channel,
            consumer,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn next(&mut self) -> Option<Envelope> {
        let delivery = self.consumer.recv().await?;
        Some(Envelope::new(delivery, self.channel.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, Connection};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_every_receiver_gets_the_broadcast() {
        let broker = Arc::new(Broker::new());
        let conn = Connection::local(broker.clone());

        let mut receivers = Vec::new();
        for _ in 0..3 {
            let ch = conn.create_channel().await.unwrap();
            receivers.push(FanoutReceiver::bind_ephemeral(ch).await.unwrap());
        }
        let fanout = Fanout::new(conn.create_channel().await.unwrap());
        let request = SumRequest::new("sum-1-x", "amq.gen-reply");
        fanout.broadcast(&request).await.unwrap();

        for receiver in receivers.iter_mut() {
            let envelope = receiver.next().await.unwrap();
            let props = &envelope.delivery().properties;
            assert_eq!(props.correlation_id.as_deref(), Some("sum-1-x"));
            assert_eq!(props.reply_to.as_deref(), Some("amq.gen-reply"));
            assert_eq!(SumRequest::decode(envelope.body()).unwrap(), request);
            envelope.ack().await.unwrap();
        }
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_receiver_queue_dies_with_its_channel() {
        let broker = Arc::new(Broker::new());
        let conn = Connection::local(broker.clone());
        let ch = conn.create_channel().await.unwrap();
        let receiver = FanoutReceiver::bind_ephemeral(ch.clone()).await.unwrap();
        let address = receiver.address().to_string();
        assert!(broker.queue_exists(&address));

        ch.close().await.unwrap();
        assert!(!broker.queue_exists(&address));
    }

    #[tokio::test]
    async fn test_broadcast_without_receivers_is_lost() {
        let broker = Arc::new(Broker::new());
        let conn = Connection::local(broker);
        let ch = conn.create_channel().await.unwrap();
        ch.declare_fanout(SUM_EXCHANGE).await.unwrap();
        Fanout::new(ch.clone())
            .broadcast(&SumRequest::new("t", "q"))
            .await
            .unwrap();

        let mut late = FanoutReceiver::bind_ephemeral(conn.create_channel().await.unwrap())
            .await
            .unwrap();
        let nothing =
            tokio::time::timeout(std::time::Duration::from_millis(50), late.next()).await;
        assert!(nothing.is_err());
    }
}
