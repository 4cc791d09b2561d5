//! Broker TCP server
//!
//! Exposes a [`Broker`] to other processes. Every accepted socket is a
//! session owning the channels it opened; when the socket goes away the
//! session closes them, which requeues whatever the peer had not acked yet.

use crate::broker::core::{Broker, ChannelId};
use crate::broker::protocol::{apply, read_frame, write_frame, Frame, Op, Reply, PROTOCOL_VERSION};
use crate::common::{Error, RemoteError, Result};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tracing::Instrument;

pub struct BrokerServer {
    broker: Arc<Broker>,
    listener: TcpListener,
}

impl BrokerServer {
    pub async fn bind(addr: impl ToSocketAddrs, broker: Arc<Broker>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { broker, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the listener fails.
    pub async fn serve(self) -> Result<()> {
        tracing::info!("Broker listening on {}", self.listener.local_addr()?);
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let broker = self.broker.clone();
            let span = tracing::info_span!("broker_session", peer = %peer);
            tokio::spawn(
                async move {
                    tracing::debug!("client connected");
                    match handle_connection(broker, stream).await {
                        Ok(()) => tracing::debug!("client disconnected"),
                        Err(e) => tracing::warn!("session ended with error: {}", e),
                    }
                }
                .instrument(span),
            );
        }
    }
}

struct Session {
    broker: Arc<Broker>,
    channels: HashSet<ChannelId>,
    out: mpsc::UnboundedSender<Frame>,
}

impl Session {
    fn handle(&mut self, channel: ChannelId, op: Op) -> Result<Reply> {
        if !matches!(op, Op::OpenChannel) && !self.channels.contains(&channel) {
            return Err(Error::ChannelClosed);
        }

        match op {
            Op::OpenChannel => {
                let reply = apply(&self.broker, channel, op, None)?;
                if let Reply::ChannelOpened(id) = reply {
                    self.channels.insert(id);
                }
                Ok(reply)
            }
            Op::CloseChannel => {
                self.channels.remove(&channel);
                apply(&self.broker, channel, op, None)
            }
            Op::Consume { .. } => {
                let (tx, mut rx) = mpsc::unbounded_channel();
                let reply = apply(&self.broker, channel, op, Some(tx))?;
                // Ends once the broker drops the consumer (cancel, queue
                // deletion or channel close).
                let out = self.out.clone();
                tokio::spawn(async move {
                    while let Some(delivery) = rx.recv().await {
                        if out.send(Frame::Deliver { channel, delivery }).is_err() {
                            break;
                        }
                    }
                });
                Ok(reply)
            }
            op => apply(&self.broker, channel, op, None),
        }
    }

    fn close(&mut self) {
        for channel in self.channels.drain() {
            self.broker.close_channel(channel);
        }
    }
}

async fn handle_connection(broker: Arc<Broker>, stream: TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();

    match read_frame(&mut reader).await? {
        Some(Frame::Hello { version }) if version == PROTOCOL_VERSION => {}
        Some(Frame::Hello { version }) => {
            return Err(Error::Broker(format!(
                "protocol version mismatch: client {}, broker {}",
                version, PROTOCOL_VERSION
            )))
        }
        Some(other) => {
            return Err(Error::Broker(format!(
                "expected Hello, got {:?}",
                other
            )))
        }
        None => return Ok(()),
    }
    write_frame(
        &mut writer,
        &Frame::Hello {
            version: PROTOCOL_VERSION,
        },
    )
    .await?;

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                tracing::debug!("write to client failed: {}", e);
                break;
            }
        }
    });

    let mut session = Session {
        broker,
        channels: HashSet::new(),
        out: out_tx,
    };

    let result = loop {
        match read_frame(&mut reader).await {
            Ok(Some(Frame::Request { id, channel, op })) => {
                let result = session
                    .handle(channel, op)
                    .map_err(|e| RemoteError::from(&e));
                if session.out.send(Frame::Response { id, result }).is_err() {
                    break Err(Error::ConnectionClosed);
                }
            }
            Ok(Some(other)) => {
                break Err(Error::Broker(format!("unexpected frame from client: {:?}", other)))
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    session.close();
    drop(session);
    // Flushes queued frames if the peer is still reading
    let _ = writer_task.await;
    result
}
