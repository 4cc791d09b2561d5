//! Direct replies to a coordinator's private address

use crate::broker::{Channel, Consumer, Delivery, Properties, QueueOptions};
use crate::common::{Result, SumReply, CONTENT_TYPE_JSON};

/// Publish a reply straight to `address` through the default exchange.
///
/// If the address no longer exists the reply is silently dropped by the
/// broker.
pub async fn send_reply(channel: &Channel, address: &str, reply: &SumReply) -> Result<()> {
    let properties = Properties {
        content_type: Some(CONTENT_TYPE_JSON.to_string()),
        correlation_id: Some(reply.correlation_token.clone()),
        ..Default::default()
    };
    channel.publish("", address, properties, reply.encode()?).await
}

/// Server-named, exclusive queue consumed without acknowledgements.
///
/// Owns its channel; [`ReplyInbox::close`] tears both down.
pub struct ReplyInbox {
    address: String,
    channel: Channel,
    consumer: Consumer,
}

impl ReplyInbox {
    pub async fn open(channel: Channel) -> Result<Self> {
        let address = channel.declare_queue("", QueueOptions::ephemeral()).await?;
        let consumer = channel.consume(&address, true).await?;
        Ok(Self {
            address,
            channel,
            consumer,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn recv(&mut self) -> Option<Delivery> {
        self.consumer.recv().await
    }

    /// Cancel the consumer, delete the queue and close the channel.
    ///
    /// Best effort: each step runs even if an earlier one failed, failures
    /// are only logged.
    pub async fn close(self) {
        if let Err(e) = self.channel.cancel(&self.consumer).await {
            tracing::debug!(
                queue = %self.address,
                consumer = self.consumer.tag(),
                "cancel failed: {}",
                e
            );
        }
        if let Err(e) = self.channel.delete_queue(&self.address).await {
            tracing::debug!(queue = %self.address, "delete failed: {}", e);
        }
        if let Err(e) = self.channel.close().await {
            tracing::debug!(queue = %self.address, "channel close failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, Connection};
    use crate::common::WorkerId;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_reply_reaches_inbox_and_late_reply_is_dropped() {
        let broker = Arc::new(Broker::new());
        let conn = Connection::local(broker.clone());
        let mut inbox = ReplyInbox::open(conn.create_channel().await.unwrap())
            .await
            .unwrap();
        let address = inbox.address().to_string();

        let worker = conn.create_channel().await.unwrap();
        let reply = SumReply {
            worker_id: WorkerId::new(1).unwrap(),
            partial_sum: 2,
            correlation_token: "sum-1-a".into(),
        };
        send_reply(&worker, &address, &reply).await.unwrap();

        let delivery = inbox.recv().await.unwrap();
        assert_eq!(SumReply::decode(&delivery.body).unwrap(), reply);
        assert_eq!(
            delivery.properties.correlation_id.as_deref(),
            Some("sum-1-a")
        );

        inbox.close().await;
        assert!(!broker.queue_exists(&address));

        // After teardown the reply goes nowhere and nothing is created
        send_reply(&worker, &address, &reply).await.unwrap();
        assert!(!broker.queue_exists(&address));
    }
}
