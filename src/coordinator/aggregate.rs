//! Scatter-gather sum aggregation
//!
//! One call broadcasts a sum request carrying a fresh correlation token and
//! a private reply address, then collects matching replies until the window
//! closes. The window is always waited out in full: the number of live
//! workers is not known in advance.

use crate::broker::Connection;
use crate::common::{generate_correlation_token, AggregateResult, Result, SumReply, SumRequest};
use crate::queue::{Fanout, ReplyInbox};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

/// Future returned by [`Clock::sleep`]
pub type Sleep = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Source of the aggregation deadline
pub trait Clock: Send + Sync {
    fn sleep(&self, duration: Duration) -> Sleep;
}

/// Wall-clock deadline backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn sleep(&self, duration: Duration) -> Sleep {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Running total of the replies matching one correlation token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTally {
    token: String,
    total: i64,
    responded: usize,
}

impl ReplyTally {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            total: 0,
            responded: 0,
        }
    }

    /// Count a reply if it belongs to this round. Returns whether it did.
    pub fn offer(&mut self, reply: &SumReply) -> bool {
        if reply.correlation_token != self.token {
            return false;
        }
        self.total = self.total.saturating_add(reply.partial_sum);
        self.responded += 1;
        true
    }

    /// Decode and count a raw reply body; undecodable bodies are ignored.
    pub fn offer_body(&mut self, body: &[u8]) -> bool {
        match SumReply::decode(body) {
            Ok(reply) => self.offer(&reply),
            Err(e) => {
                tracing::debug!("ignoring undecodable reply: {}", e);
                false
            }
        }
    }

    pub fn total(&self) -> i64 {
        self.total
    }

    pub fn responded(&self) -> usize {
        self.responded
    }

    pub fn finish(self, window: Duration) -> AggregateResult {
        AggregateResult {
            total: self.total,
            responded_count: self.responded,
            window_ms: window.as_millis() as u64,
        }
    }
}

/// Issues sum aggregations over a broker connection
#[derive(Clone)]
pub struct SumCoordinator {
    connection: Connection,
    clock: Arc<dyn Clock>,
}

impl SumCoordinator {
    pub fn new(connection: Connection) -> Self {
        Self::with_clock(connection, Arc::new(TokioClock))
    }

    pub fn with_clock(connection: Connection, clock: Arc<dyn Clock>) -> Self {
        Self { connection, clock }
    }

    /// Broadcast a sum request and gather replies for `window`.
    ///
    /// Errors only when the round cannot be set up; zero replies is a valid
    /// result. Concurrent calls use separate channels, queues and tokens.
    pub async fn request_sum_aggregate(&self, window: Duration) -> Result<AggregateResult> {
        let token = generate_correlation_token();
        let span = tracing::info_span!("sum_aggregate", token = %token);
        self.run_round(token, window).instrument(span).await
    }

    async fn run_round(&self, token: String, window: Duration) -> Result<AggregateResult> {
        let channel = self.connection.create_channel().await?;
        // On failure below, dropping the channel closes it and removes the queue
        let mut inbox = ReplyInbox::open(channel.clone()).await?;

        let request = SumRequest::new(token.clone(), inbox.address());
        if let Err(e) = Fanout::new(channel).broadcast(&request).await {
            tracing::warn!("sum broadcast failed: {}", e);
            inbox.close().await;
            return Err(e);
        }
        tracing::debug!(reply_address = %inbox.address(), "sum request broadcast");

        let mut tally = ReplyTally::new(token);
        let mut deadline = self.clock.sleep(window);
        loop {
            tokio::select! {
                // Replies already buffered count before the deadline is checked
                biased;
                delivery = inbox.recv() => match delivery {
                    Some(delivery) => {
                        if !tally.offer_body(&delivery.body) {
                            tracing::debug!("discarded reply for another round");
                        }
                    }
                    None => {
                        tracing::warn!("reply inbox closed early; waiting out the window");
                        deadline.await;
                        break;
                    }
                },
                _ = &mut deadline => break,
            }
        }

        inbox.close().await;
        let result = tally.finish(window);
        tracing::info!(
            total = result.total,
            responded = result.responded_count,
            window_ms = result.window_ms,
            "sum aggregation complete"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, Channel};
    use crate::common::{WorkerId, SUM_EXCHANGE};
    use crate::queue::{send_reply, FanoutReceiver};
    use tokio::sync::{mpsc, watch};

    /// Deadline released by hand
    struct ManualClock {
        released: watch::Sender<bool>,
    }

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                released: watch::channel(false).0,
            })
        }

        fn release(&self) {
            self.released.send_replace(true);
        }
    }

    impl Clock for ManualClock {
        fn sleep(&self, _duration: Duration) -> Sleep {
            let mut rx = self.released.subscribe();
            Box::pin(async move {
                let _ = rx.wait_for(|released| *released).await;
            })
        }
    }

    fn reply(worker: u32, partial_sum: i64, token: &str) -> SumReply {
        SumReply {
            worker_id: WorkerId::new(worker).unwrap(),
            partial_sum,
            correlation_token: token.to_string(),
        }
    }

    #[test]
    fn test_tally_filters_by_token() {
        let mut tally = ReplyTally::new("sum-1-a");
        assert!(tally.offer(&reply(1, 2, "sum-1-a")));
        assert!(!tally.offer(&reply(2, 100, "sum-0-stale")));
        assert!(tally.offer(&reply(2, 5, "sum-1-a")));
        assert!(tally.offer(&reply(3, 0, "sum-1-a")));
        assert!(!tally.offer_body(b"{not json"));

        let result = tally.finish(Duration::from_millis(1500));
        assert_eq!(
            result,
            AggregateResult {
                total: 7,
                responded_count: 3,
                window_ms: 1500
            }
        );
    }

    #[test]
    fn test_tally_saturates() {
        let mut tally = ReplyTally::new("t");
        tally.offer(&reply(1, i64::MAX, "t"));
        tally.offer(&reply(2, 1, "t"));
        assert_eq!(tally.total(), i64::MAX);
        assert_eq!(tally.responded(), 2);
    }

    /// Answers every sum request with a fixed partial sum and reports each
    /// reply it sent.
    async fn fake_worker(conn: &Connection, id: u32, partial_sum: i64, sent: mpsc::UnboundedSender<()>) {
        let channel: Channel = conn.create_channel().await.unwrap();
        let mut receiver = FanoutReceiver::bind_ephemeral(channel.clone()).await.unwrap();
        tokio::spawn(async move {
            while let Some(envelope) = receiver.next().await {
                let request = SumRequest::decode(envelope.body()).unwrap();
                send_reply(
                    &channel,
                    &request.reply_address,
                    &reply(id, partial_sum, &request.correlation_token),
                )
                .await
                .unwrap();
                envelope.ack().await.unwrap();
                let _ = sent.send(());
            }
        });
    }

    #[tokio::test]
    async fn test_round_collects_partial_sums() {
        let broker = Arc::new(Broker::new());
        let conn = Connection::local(broker.clone());
        conn.create_channel()
            .await
            .unwrap()
            .declare_fanout(SUM_EXCHANGE)
            .await
            .unwrap();

        let (sent_tx, mut sent_rx) = mpsc::unbounded_channel();
        for (id, partial) in [(1, 2), (2, 5), (3, 0)] {
            fake_worker(&conn, id, partial, sent_tx.clone()).await;
        }

        let clock = ManualClock::new();
        let coordinator = SumCoordinator::with_clock(conn.clone(), clock.clone());
        let round = tokio::spawn(async move {
            coordinator
                .request_sum_aggregate(Duration::from_millis(1500))
                .await
        });

        for _ in 0..3 {
            sent_rx.recv().await.unwrap();
        }
        clock.release();

        let result = round.await.unwrap().unwrap();
        assert_eq!(
            result,
            AggregateResult {
                total: 7,
                responded_count: 3,
                window_ms: 1500
            }
        );
        // Only the workers' receiver queues remain
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_no_workers_yields_empty_result() {
        let broker = Arc::new(Broker::new());
        let conn = Connection::local(broker);
        conn.create_channel()
            .await
            .unwrap()
            .declare_fanout(SUM_EXCHANGE)
            .await
            .unwrap();

        let clock = ManualClock::new();
        clock.release();
        let coordinator = SumCoordinator::with_clock(conn, clock);
        let result = coordinator
            .request_sum_aggregate(Duration::from_millis(1500))
            .await
            .unwrap();
        assert_eq!(
            result,
            AggregateResult {
                total: 0,
                responded_count: 0,
                window_ms: 1500
            }
        );
    }

    #[tokio::test]
    async fn test_missing_exchange_is_setup_error() {
        let broker = Arc::new(Broker::new());
        let conn = Connection::local(broker.clone());
        let coordinator = SumCoordinator::new(conn);
        let err = coordinator
            .request_sum_aggregate(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::common::Error::ExchangeNotFound(_)));
    }

    #[tokio::test]
    async fn test_tokio_clock_waits_the_window() {
        let start = tokio::time::Instant::now();
        TokioClock.sleep(Duration::from_millis(30)).await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
