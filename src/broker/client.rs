//! Broker client: connections, channels and consumers
//!
//! A [`Connection`] is either in-process (wrapping an `Arc<Broker>`) or a TCP
//! link to a [`BrokerServer`](crate::broker::BrokerServer). Both hand out
//! [`Channel`]s with the same API, so coordinator and worker code never know
//! which one they hold.
//!
//! Channels are cheap and not meant to be shared between roles: open one per
//! producer or consumer. Dropping the last handle to a channel closes it.

use crate::broker::core::{Broker, ChannelId, Delivery, DeliveryTag, Properties, QueueOptions};
use crate::broker::protocol::{apply, read_frame, write_frame, Frame, Op, Reply, PROTOCOL_VERSION};
use crate::common::utils::generate_consumer_tag;
use crate::common::{Error, RemoteError, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::Stream;

type Pending = oneshot::Sender<std::result::Result<Reply, RemoteError>>;

/// Handle to a broker
#[derive(Clone)]
pub struct Connection {
    link: Link,
}

#[derive(Clone)]
enum Link {
    Local(Arc<Broker>),
    Remote(Arc<RemoteLink>),
}

struct RemoteLink {
    out: mpsc::UnboundedSender<Frame>,
    pending: Mutex<HashMap<u64, Pending>>,
    /// Consumer tag -> (owning channel, delivery sink)
    consumers: Mutex<HashMap<String, (ChannelId, mpsc::UnboundedSender<Delivery>)>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RemoteLink {
    async fn call(&self, channel: ChannelId, op: Op) -> Result<Reply> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            // Checked under the lock: the reader marks the link closed before
            // draining `pending`, so no request can be stranded.
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::ConnectionClosed);
            }
            pending.insert(id, tx);
        }

        if self.out.send(Frame::Request { id, channel, op }).is_err() {
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            return Err(Error::ConnectionClosed);
        }

        match rx.await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    /// Send without waiting for the response (used from `Drop`)
    fn notify(&self, channel: ChannelId, op: Op) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.out.send(Frame::Request { id, channel, op });
    }

    fn register_consumer(
        &self,
        tag: &str,
        channel: ChannelId,
        tx: mpsc::UnboundedSender<Delivery>,
    ) {
        self.consumers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tag.to_string(), (channel, tx));
    }

    fn unregister_consumer(&self, tag: &str) {
        self.consumers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(tag);
    }

    /// End the streams of every consumer opened on `channel`
    fn unregister_channel(&self, channel: ChannelId) {
        self.consumers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, (owner, _)| *owner != channel);
    }

    fn route(&self, frame: Frame) {
        match frame {
            Frame::Response { id, result } => {
                let waiter = self
                    .pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(result);
                }
            }
            Frame::Deliver { delivery, .. } => {
                let consumers = self.consumers.lock().unwrap_or_else(|e| e.into_inner());
                match consumers.get(&delivery.consumer_tag) {
                    Some((_, tx)) => {
                        let _ = tx.send(delivery);
                    }
                    None => tracing::trace!(
                        consumer = %delivery.consumer_tag,
                        "delivery for unknown consumer dropped"
                    ),
                }
            }
            other => tracing::warn!("unexpected frame from broker: {:?}", other),
        }
    }

    /// Fail every waiter and end every consumer stream.
    fn shut_down(&self) {
        self.closed.store(true, Ordering::Release);
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.consumers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl Connection {
    /// In-process connection
    pub fn local(broker: Arc<Broker>) -> Self {
        Self {
            link: Link::Local(broker),
        }
    }

    /// Connect to a broker server over TCP.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        write_frame(
            &mut writer,
            &Frame::Hello {
                version: PROTOCOL_VERSION,
            },
        )
        .await?;
        match read_frame(&mut reader).await? {
            Some(Frame::Hello { version }) if version == PROTOCOL_VERSION => {}
            Some(other) => {
                return Err(Error::Broker(format!(
                    "unexpected handshake reply: {:?}",
                    other
                )))
            }
            None => return Err(Error::ConnectionClosed),
        }

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let link = Arc::new(RemoteLink {
            out: out_tx,
            pending: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    tracing::warn!("broker write failed: {}", e);
                    break;
                }
            }
        });

        let weak = Arc::downgrade(&link);
        let reader_task = tokio::spawn(async move {
            loop {
                let frame = read_frame(&mut reader).await;
                let Some(link) = weak.upgrade() else {
                    break;
                };
                match frame {
                    Ok(Some(frame)) => link.route(frame),
                    Ok(None) => {
                        tracing::warn!("broker connection closed");
                        link.shut_down();
                        break;
                    }
                    Err(e) => {
                        tracing::error!("broker connection lost: {}", e);
                        link.shut_down();
                        break;
                    }
                }
            }
        });

        link.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([writer_task, reader_task]);

        Ok(Self {
            link: Link::Remote(link),
        })
    }

    pub fn is_local(&self) -> bool {
        matches!(self.link, Link::Local(_))
    }

    pub fn is_closed(&self) -> bool {
        match &self.link {
            Link::Local(_) => false,
            Link::Remote(link) => link.closed.load(Ordering::Acquire),
        }
    }

    pub async fn create_channel(&self) -> Result<Channel> {
        let id = match &self.link {
            Link::Local(broker) => broker.open_channel(),
            Link::Remote(link) => match link.call(0, Op::OpenChannel).await? {
                Reply::ChannelOpened(id) => id,
                other => return Err(unexpected(other)),
            },
        };
        Ok(Channel {
            inner: Arc::new(ChannelInner {
                id,
                link: self.link.clone(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Drop the TCP link; the broker closes every channel opened through it.
    pub fn close(&self) {
        if let Link::Remote(link) = &self.link {
            link.shut_down();
            for task in link
                .tasks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .drain(..)
            {
                task.abort();
            }
        }
    }
}

fn unexpected(reply: Reply) -> Error {
    Error::Broker(format!("unexpected reply: {:?}", reply))
}

struct ChannelInner {
    id: ChannelId,
    link: Link,
    closed: AtomicBool,
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.link {
            Link::Local(broker) => broker.close_channel(self.id),
            Link::Remote(link) => {
                link.unregister_channel(self.id);
                link.notify(self.id, Op::CloseChannel);
            }
        }
    }
}

/// A channel on a broker connection
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Channel {
    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    async fn request(&self, op: Op) -> Result<Reply> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ChannelClosed);
        }
        match &self.inner.link {
            Link::Local(broker) => apply(broker, self.inner.id, op, None),
            Link::Remote(link) => link.call(self.inner.id, op).await,
        }
    }

    async fn request_done(&self, op: Op) -> Result<()> {
        match self.request(op).await? {
            Reply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Limit unacked deliveries for consumers created afterwards
    pub async fn qos(&self, prefetch: usize) -> Result<()> {
        self.request_done(Op::Qos { prefetch }).await
    }

    /// Declare a queue; pass `""` to get a broker-generated name.
    pub async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        match self
            .request(Op::DeclareQueue {
                name: name.to_string(),
                options,
            })
            .await?
        {
            Reply::QueueDeclared(name) => Ok(name),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete_queue(&self, name: &str) -> Result<usize> {
        match self
            .request(Op::DeleteQueue {
                name: name.to_string(),
            })
            .await?
        {
            Reply::QueueDeleted(dropped) => Ok(dropped),
            other => Err(unexpected(other)),
        }
    }

    pub async fn declare_fanout(&self, name: &str) -> Result<()> {
        self.request_done(Op::DeclareFanout {
            name: name.to_string(),
        })
        .await
    }

    pub async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<()> {
        self.request_done(Op::BindQueue {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
        })
        .await
    }

    /// Publish and wait until the broker has routed (or rejected) the message.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: Properties,
        body: impl Into<Bytes>,
    ) -> Result<()> {
        self.request_done(Op::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties,
            body: body.into(),
        })
        .await
    }

    pub async fn consume(&self, queue: &str, no_ack: bool) -> Result<Consumer> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ChannelClosed);
        }

        let tag = generate_consumer_tag();
        let (tx, rx) = mpsc::unbounded_channel();
        let op = Op::Consume {
            queue: queue.to_string(),
            consumer_tag: tag.clone(),
            no_ack,
        };

        let reply = match &self.inner.link {
            Link::Local(broker) => apply(broker, self.inner.id, op, Some(tx))?,
            Link::Remote(link) => {
                // Registered first: deliveries may overtake the ConsumeOk
                link.register_consumer(&tag, self.inner.id, tx);
                match link.call(self.inner.id, op).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        link.unregister_consumer(&tag);
                        return Err(e);
                    }
                }
            }
        };

        match reply {
            Reply::ConsumeOk(tag) => Ok(Consumer { tag, rx }),
            other => Err(unexpected(other)),
        }
    }

    pub async fn cancel(&self, consumer: &Consumer) -> Result<()> {
        let result = self
            .request_done(Op::Cancel {
                consumer_tag: consumer.tag.clone(),
            })
            .await;
        if let Link::Remote(link) = &self.inner.link {
            link.unregister_consumer(&consumer.tag);
        }
        result
    }

    pub async fn ack(&self, delivery_tag: DeliveryTag) -> Result<()> {
        self.request_done(Op::Ack { delivery_tag }).await
    }

    pub async fn nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.request_done(Op::Nack {
            delivery_tag,
            requeue,
        })
        .await
    }

    /// Close the channel for every holder of this handle.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match &self.inner.link {
            Link::Local(broker) => {
                broker.close_channel(self.inner.id);
                Ok(())
            }
            Link::Remote(link) => {
                link.unregister_channel(self.inner.id);
                match link.call(self.inner.id, Op::CloseChannel).await {
                    Ok(_) | Err(Error::ConnectionClosed) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        }
    }
}

/// Stream of deliveries for one consumer tag.
///
/// Ends when the consumer is cancelled, its queue deleted, its channel closed
/// or the connection lost.
pub struct Consumer {
    tag: String,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Consumer {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

impl Stream for Consumer {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Delivery>> {
        self.rx.poll_recv(cx)
    }
}
