//! Scatter-gather aggregation over an in-process broker

use fansum::broker::{Broker, Connection};
use fansum::common::{AggregateResult, SumReply, SumRequest, WorkerId};
use fansum::coordinator::{Supervisor, SumCoordinator};
use fansum::queue::{declare_topology, send_reply, FanoutReceiver};
use fansum::store::{MemoryStore, NumberStore};
use fansum::worker::WorkerNode;
use std::sync::Arc;
use std::time::Duration;

fn id(n: u32) -> WorkerId {
    WorkerId::new(n).unwrap()
}

async fn setup() -> (Arc<Broker>, Connection) {
    let broker = Arc::new(Broker::new());
    let conn = Connection::local(broker.clone());
    let setup = conn.create_channel().await.unwrap();
    declare_topology(&setup, None).await.unwrap();
    setup.close().await.unwrap();
    (broker, conn)
}

/// Store holding partial sums 2, 5 and 0 for workers 1, 2 and 3
fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.persist(id(1), 2).unwrap();
    store.persist(id(2), 3).unwrap();
    store.persist(id(2), 2).unwrap();
    store
}

#[tokio::test]
async fn test_three_workers_full_window() {
    let (_broker, conn) = setup().await;
    let supervisor = Supervisor::start_embedded(3, &conn, seeded_store())
        .await
        .unwrap();

    let coordinator = SumCoordinator::new(conn.clone());
    let started = tokio::time::Instant::now();
    let result = coordinator
        .request_sum_aggregate(Duration::from_millis(1500))
        .await
        .unwrap();

    assert_eq!(
        result,
        AggregateResult {
            total: 7,
            responded_count: 3,
            window_ms: 1500
        }
    );
    // Always waits the whole window, even once everyone answered
    assert!(started.elapsed() >= Duration::from_millis(1500));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_zero_workers() {
    let (_broker, conn) = setup().await;
    let result = SumCoordinator::new(conn)
        .request_sum_aggregate(Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(
        result,
        AggregateResult {
            total: 0,
            responded_count: 0,
            window_ms: 200
        }
    );
}

#[tokio::test]
async fn test_concurrent_rounds_are_isolated() {
    let (_broker, conn) = setup().await;
    let supervisor = Supervisor::start_embedded(3, &conn, seeded_store())
        .await
        .unwrap();

    let coordinator = SumCoordinator::new(conn.clone());
    let window = Duration::from_millis(300);
    let (a, b) = tokio::join!(
        coordinator.request_sum_aggregate(window),
        coordinator.request_sum_aggregate(window)
    );

    for result in [a.unwrap(), b.unwrap()] {
        assert_eq!(result.total, 7);
        assert_eq!(result.responded_count, 3);
    }
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_stale_token_does_not_count() {
    let (_broker, conn) = setup().await;
    let store = seeded_store();
    let _worker = WorkerNode::new(id(1), conn.clone(), store)
        .start()
        .await
        .unwrap();

    // Answers with a foreign token as well as the right one
    let channel = conn.create_channel().await.unwrap();
    let mut rogue = FanoutReceiver::bind_ephemeral(channel.clone()).await.unwrap();
    tokio::spawn(async move {
        while let Some(envelope) = rogue.next().await {
            let request = SumRequest::decode(envelope.body()).unwrap();
            for token in ["sum-0-stale", request.correlation_token.as_str()] {
                let reply = SumReply {
                    worker_id: WorkerId::new(9).unwrap(),
                    partial_sum: 100,
                    correlation_token: token.to_string(),
                };
                send_reply(&channel, &request.reply_address, &reply)
                    .await
                    .unwrap();
            }
            envelope.ack().await.unwrap();
        }
    });

    let result = SumCoordinator::new(conn)
        .request_sum_aggregate(Duration::from_millis(300))
        .await
        .unwrap();
    // Worker 1 (2) plus the rogue's matching reply (100), stale one dropped
    assert_eq!(result.total, 102);
    assert_eq!(result.responded_count, 2);
}

#[tokio::test]
async fn test_crashed_worker_is_not_waited_for() {
    let (_broker, conn) = setup().await;
    let store = seeded_store();
    let _alive = WorkerNode::new(id(1), conn.clone(), store.clone())
        .start()
        .await
        .unwrap();
    let crashed = WorkerNode::new(id(2), conn.clone(), store)
        .start()
        .await
        .unwrap();

    crashed.abort();
    crashed.join().await.unwrap();

    let result = SumCoordinator::new(conn)
        .request_sum_aggregate(Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(result.total, 2);
    assert_eq!(result.responded_count, 1);
}

#[tokio::test]
async fn test_reply_queue_removed_after_round() {
    let (broker, conn) = setup().await;
    let _worker = WorkerNode::new(id(1), conn.clone(), seeded_store())
        .start()
        .await
        .unwrap();

    // Capture the reply address the coordinator uses
    let spy_channel = conn.create_channel().await.unwrap();
    let mut spy = FanoutReceiver::bind_ephemeral(spy_channel).await.unwrap();

    SumCoordinator::new(conn.clone())
        .request_sum_aggregate(Duration::from_millis(100))
        .await
        .unwrap();

    let envelope = spy.next().await.unwrap();
    let request = SumRequest::decode(envelope.body()).unwrap();
    assert!(!broker.queue_exists(&request.reply_address));

    // A late reply is dropped instead of recreating the queue
    let late = conn.create_channel().await.unwrap();
    send_reply(
        &late,
        &request.reply_address,
        &SumReply {
            worker_id: id(1),
            partial_sum: 1,
            correlation_token: request.correlation_token.clone(),
        },
    )
    .await
    .unwrap();
    assert!(!broker.queue_exists(&request.reply_address));
}
