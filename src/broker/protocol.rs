//! Broker wire protocol
//!
//! Remote clients talk to the broker over TCP. Each frame is prefixed with a
//! 4-byte length field (little-endian u32) followed by the bincode encoding of
//! a [`Frame`]:
//!
//! ```text
//! [4 bytes: frame length][N bytes: bincode-serialized frame]
//! ```
//!
//! # Message Flow
//!
//! ```text
//! Client                              Broker
//!   |-------- Hello(version) ----------->|
//!   |<------- Hello(version) ------------|
//!   |                                    |
//!   |-- Request(id, channel, op) ------->|
//!   |<------- Response(id, result) ------|
//!   |                                    |
//!   |<------- Deliver(channel, msg) -----|   (pushed for every consumer)
//! ```
//!
//! Requests carry a client-chosen id; the response echoes it. Requests on a
//! connection are answered in order, deliveries may be interleaved freely.

use crate::broker::core::{Broker, ChannelId, Delivery, DeliveryTag, Properties, QueueOptions};
use crate::common::{Error, RemoteError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Increment on breaking frame changes; both ends must match.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single frame
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Operation requested by a client on one of its channels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Op {
    OpenChannel,
    CloseChannel,
    Qos {
        prefetch: usize,
    },
    DeclareQueue {
        name: String,
        options: QueueOptions,
    },
    DeleteQueue {
        name: String,
    },
    DeclareFanout {
        name: String,
    },
    BindQueue {
        queue: String,
        exchange: String,
    },
    Publish {
        exchange: String,
        routing_key: String,
        properties: Properties,
        body: Bytes,
    },
    Consume {
        queue: String,
        consumer_tag: String,
        no_ack: bool,
    },
    Cancel {
        consumer_tag: String,
    },
    Ack {
        delivery_tag: DeliveryTag,
    },
    Nack {
        delivery_tag: DeliveryTag,
        requeue: bool,
    },
}

/// Successful outcome of an [`Op`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Done,
    ChannelOpened(ChannelId),
    QueueDeclared(String),
    QueueDeleted(usize),
    ConsumeOk(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    Hello {
        version: u32,
    },
    Request {
        id: u64,
        channel: ChannelId,
        op: Op,
    },
    Response {
        id: u64,
        result: std::result::Result<Reply, RemoteError>,
    },
    Deliver {
        channel: ChannelId,
        delivery: Delivery,
    },
}

/// Run a channel-scoped operation against the broker.
///
/// Shared by the TCP server and in-process channels so both paths have the
/// same semantics. `Consume` needs the sender its deliveries go to.
pub fn apply(
    broker: &Broker,
    channel: ChannelId,
    op: Op,
    deliveries: Option<mpsc::UnboundedSender<Delivery>>,
) -> Result<Reply> {
    match op {
        Op::OpenChannel => Ok(Reply::ChannelOpened(broker.open_channel())),
        Op::CloseChannel => {
            broker.close_channel(channel);
            Ok(Reply::Done)
        }
        Op::Qos { prefetch } => broker.qos(channel, prefetch).map(|_| Reply::Done),
        Op::DeclareQueue { name, options } => broker
            .declare_queue(channel, &name, options)
            .map(Reply::QueueDeclared),
        Op::DeleteQueue { name } => broker
            .delete_queue(channel, &name)
            .map(Reply::QueueDeleted),
        Op::DeclareFanout { name } => broker.declare_fanout(channel, &name).map(|_| Reply::Done),
        Op::BindQueue { queue, exchange } => broker
            .bind_queue(channel, &queue, &exchange)
            .map(|_| Reply::Done),
        Op::Publish {
            exchange,
            routing_key,
            properties,
            body,
        } => broker
            .publish(channel, &exchange, &routing_key, properties, body)
            .map(|_| Reply::Done),
        Op::Consume {
            queue,
            consumer_tag,
            no_ack,
        } => {
            let tx = deliveries
                .ok_or_else(|| Error::Internal("consume without a delivery sink".into()))?;
            broker
                .consume(channel, &queue, &consumer_tag, no_ack, tx)
                .map(Reply::ConsumeOk)
        }
        Op::Cancel { consumer_tag } => broker.cancel(channel, &consumer_tag).map(|_| Reply::Done),
        Op::Ack { delivery_tag } => broker.ack(channel, delivery_tag).map(|_| Reply::Done),
        Op::Nack {
            delivery_tag,
            requeue,
        } => broker
            .nack(channel, delivery_tag, requeue)
            .map(|_| Reply::Done),
    }
}

/// Serialize a frame with its length prefix
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>> {
    let payload = bincode::serialize(frame)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(payload.len()));
    }

    let mut framed = Vec::with_capacity(4 + payload.len());
    framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    framed.extend_from_slice(&payload);
    Ok(framed)
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(bincode::deserialize(&payload)?))
}

/// Write one frame and flush it
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let framed = encode_frame(frame)?;
    writer.write_all(&framed).await?;
    writer.flush().await?;
    Ok(())
}
