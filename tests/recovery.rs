//! Crash recovery: record logs across restarts and redelivery of writes that
//! were never acknowledged

use fansum::broker::{Broker, BrokerServer, Connection, Properties};
use fansum::common::{SyncPolicy, WorkerId, WriteRequest, WRITES_QUEUE};
use fansum::queue::{declare_topology, WorkConsumer, WorkQueue};
use fansum::store::{LogStore, NumberStore};
use fansum::worker::writes::{handle_write, WriteOutcome};
use fansum::worker::WorkerNode;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn id(n: u32) -> WorkerId {
    WorkerId::new(n).unwrap()
}

async fn start_broker() -> (Arc<Broker>, SocketAddr) {
    let broker = Arc::new(Broker::new());
    let setup = Connection::local(broker.clone())
        .create_channel()
        .await
        .unwrap();
    declare_topology(&setup, None).await.unwrap();
    setup.close().await.unwrap();

    let server = BrokerServer::bind("127.0.0.1:0", broker.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());
    (broker, addr)
}

#[test]
fn test_log_survives_restart() {
    let dir = TempDir::new().unwrap();
    {
        let store = LogStore::open(dir.path(), SyncPolicy::Always).unwrap();
        store.persist(id(1), 2).unwrap();
        store.persist(id(1), 40).unwrap();
        store.persist(id(2), 7).unwrap();
    }

    let store = LogStore::open(dir.path(), SyncPolicy::Always).unwrap();
    assert_eq!(store.sum_for(id(1)).unwrap(), 42);
    assert_eq!(store.sum_for(id(2)).unwrap(), 7);

    // Ids keep increasing after a restart
    let next = store.persist(id(1), 1).unwrap();
    let previous = store.records(id(1)).unwrap();
    assert!(previous[..2].iter().all(|r| r.id < next.id));
}

#[test]
fn test_torn_write_is_dropped_on_restart() {
    let dir = TempDir::new().unwrap();
    let path = {
        let store = LogStore::open(dir.path(), SyncPolicy::Always).unwrap();
        store.persist(id(3), 10).unwrap();
        store.persist(id(3), 20).unwrap();
        store.path_for(id(3))
    };

    // Crash halfway through appending a third record
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(b"FSN1\x01\x02\x03").unwrap();
    drop(file);

    let store = LogStore::open(dir.path(), SyncPolicy::Always).unwrap();
    assert_eq!(store.sum_for(id(3)).unwrap(), 30);
    store.persist(id(3), 5).unwrap();
    assert_eq!(store.records(id(3)).unwrap().len(), 3);
    assert_eq!(store.sum_for(id(3)).unwrap(), 35);
}

#[tokio::test]
async fn test_unacked_write_is_redelivered_after_crash() {
    let (broker, addr) = start_broker().await;
    let dir = TempDir::new().unwrap();
    let store = Arc::new(LogStore::open(dir.path(), SyncPolicy::Always).unwrap());

    let producer = Connection::connect(addr).await.unwrap();
    WorkQueue::new(producer.create_channel().await.unwrap())
        .enqueue(WriteRequest { value: 9 })
        .await
        .unwrap();

    // Takes the write, then its process dies before persisting it
    let doomed = Connection::connect(addr).await.unwrap();
    let mut consumer = WorkConsumer::open(doomed.create_channel().await.unwrap())
        .await
        .unwrap();
    let taken = consumer.next().await.unwrap();
    assert!(!taken.redelivered());
    assert_eq!(broker.unacked_count(), 1);
    doomed.close();

    let survivor = Connection::connect(addr).await.unwrap();
    let _worker = WorkerNode::new(id(2), survivor, store.clone())
        .start()
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        while store.sum_for(id(2)).unwrap() != 9 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("write was not redelivered");

    assert!(store.records(id(1)).unwrap().is_empty());
    assert_eq!(store.records(id(2)).unwrap().len(), 1);
}

#[tokio::test]
async fn test_malformed_write_is_dropped_not_redelivered() {
    let (broker, addr) = start_broker().await;
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn NumberStore> =
        Arc::new(LogStore::open(dir.path(), SyncPolicy::Always).unwrap());

    let conn = Connection::connect(addr).await.unwrap();
    let producer = conn.create_channel().await.unwrap();
    producer
        .publish("", WRITES_QUEUE, Properties::default(), &b"not a write"[..])
        .await
        .unwrap();

    let mut consumer = WorkConsumer::open(conn.create_channel().await.unwrap())
        .await
        .unwrap();
    let envelope = consumer.next().await.unwrap();
    let outcome = handle_write(id(1), &store, envelope).await.unwrap();
    assert_eq!(outcome, WriteOutcome::Malformed);

    assert_eq!(broker.queue_len(WRITES_QUEUE), Some(0));
    assert_eq!(broker.unacked_count(), 0);
    assert!(store.counts_by_worker().unwrap().is_empty());

    // Nothing comes back even after the consumer goes away
    conn.close();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.queue_len(WRITES_QUEUE), Some(0));
}

#[tokio::test]
async fn test_acked_write_is_not_redelivered_after_disconnect() {
    let (broker, addr) = start_broker().await;
    let dir = TempDir::new().unwrap();
    let store = Arc::new(LogStore::open(dir.path(), SyncPolicy::Always).unwrap());
    let handle: Arc<dyn NumberStore> = store.clone();

    let producer = Connection::connect(addr).await.unwrap();
    WorkQueue::new(producer.create_channel().await.unwrap())
        .enqueue(WriteRequest { value: 11 })
        .await
        .unwrap();

    // Stores and acks the write, then its process goes away
    let finished = Connection::connect(addr).await.unwrap();
    let mut consumer = WorkConsumer::open(finished.create_channel().await.unwrap())
        .await
        .unwrap();
    let envelope = consumer.next().await.unwrap();
    let outcome = handle_write(id(1), &handle, envelope).await.unwrap();
    assert_eq!(outcome, WriteOutcome::Stored { id: 1, value: 11 });
    assert_eq!(broker.unacked_count(), 0);
    finished.close();

    let survivor = Connection::connect(addr).await.unwrap();
    let _worker = WorkerNode::new(id(2), survivor, handle.clone())
        .start()
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(broker.queue_len(WRITES_QUEUE), Some(0));
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(store.records(id(1)).unwrap().len(), 1);
    assert!(store.records(id(2)).unwrap().is_empty());
}

#[tokio::test]
async fn test_persisted_but_unacked_write_is_stored_twice() {
    let (_broker, addr) = start_broker().await;
    let dir = TempDir::new().unwrap();
    let store = Arc::new(LogStore::open(dir.path(), SyncPolicy::Always).unwrap());

    let producer = Connection::connect(addr).await.unwrap();
    WorkQueue::new(producer.create_channel().await.unwrap())
        .enqueue(WriteRequest { value: 6 })
        .await
        .unwrap();

    // Persists the write but dies before its ack goes out
    let doomed = Connection::connect(addr).await.unwrap();
    let mut consumer = WorkConsumer::open(doomed.create_channel().await.unwrap())
        .await
        .unwrap();
    let taken = consumer.next().await.unwrap();
    let request = WriteRequest::decode(taken.body()).unwrap();
    store.persist(id(1), request.value).unwrap();
    doomed.close();

    let survivor = Connection::connect(addr).await.unwrap();
    let _worker = WorkerNode::new(id(2), survivor, store.clone())
        .start()
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        while store.records(id(2)).unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("write was not redelivered");

    // At-least-once: the value now counts in both workers' sums
    assert_eq!(store.sum_for(id(1)).unwrap(), 6);
    assert_eq!(store.sum_for(id(2)).unwrap(), 6);
    let stored: usize = [id(1), id(2)]
        .iter()
        .map(|&w| store.records(w).unwrap().len())
        .sum();
    assert_eq!(stored, 2);
}
