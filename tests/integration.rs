//! End-to-end tests: broker over TCP, workers on their own connections,
//! record logs on disk, requests through the HTTP router

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use fansum::broker::{Broker, BrokerServer, Connection};
use fansum::common::{SyncPolicy, WorkerConfig, WorkerId, WRITES_QUEUE};
use fansum::coordinator::http::{create_router, CoordState};
use fansum::coordinator::SumCoordinator;
use fansum::queue::{declare_topology, WorkQueue};
use fansum::store::{LogStore, NumberStore};
use fansum::worker::{WorkerHandle, WorkerNode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

struct Cluster {
    broker: Arc<Broker>,
    addr: SocketAddr,
    router: Router,
    store: Arc<LogStore>,
    workers: Vec<WorkerHandle>,
    _dir: TempDir,
}

async fn start_cluster(workers: u32) -> Cluster {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(Broker::new());
    let local = Connection::local(broker.clone());
    let setup = local.create_channel().await.unwrap();
    declare_topology(&setup, None).await.unwrap();
    setup.close().await.unwrap();

    let server = BrokerServer::bind("127.0.0.1:0", broker.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());

    let store = Arc::new(LogStore::open(dir.path(), SyncPolicy::Always).unwrap());

    // Each worker gets its own TCP connection, like a worker process would
    let mut handles = Vec::new();
    for i in 1..=workers {
        let conn = Connection::connect(addr).await.unwrap();
        let handle = WorkerNode::new(WorkerId::new(i).unwrap(), conn, store.clone())
            .start()
            .await
            .unwrap();
        handles.push(handle);
    }

    let state = CoordState {
        work_queue: WorkQueue::new(local.create_channel().await.unwrap()),
        sums: SumCoordinator::new(local),
        store: store.clone(),
        sum_window: Duration::from_millis(300),
        workers: workers as usize,
    };

    Cluster {
        broker,
        addr,
        router: create_router(state),
        store,
        workers: handles,
        _dir: dir,
    }
}

async fn call(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn write(value: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/write")
        .header("content-type", "application/json")
        .body(Body::from(format!(r#"{{"value": {}}}"#, value)))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// Wait until every queued write has been consumed and acknowledged
async fn drain(cluster: &Cluster) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while cluster.broker.queue_len(WRITES_QUEUE) != Some(0)
            || cluster.broker.unacked_count() != 0
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("writes were not drained");
}

#[tokio::test]
async fn test_write_then_sum_over_tcp() {
    let cluster = start_cluster(3).await;

    for value in ["2", "3", "2", "\"10\"", "-4"] {
        let (status, body) = call(&cluster.router, write(value)).await;
        assert_eq!(status, StatusCode::OK, "value {}", value);
        assert_eq!(body["ok"], true);
    }
    drain(&cluster).await;

    let (status, body) = call(&cluster.router, get("/api/sum")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 13);
    assert_eq!(body["respondedCount"], 3);
    assert_eq!(body["windowMs"], 300);

    // Every write landed in exactly one worker's log
    let counts = cluster.store.counts_by_worker().unwrap();
    assert_eq!(counts.iter().map(|c| c.items).sum::<u64>(), 5);
    let logged: i64 = (1..=3)
        .flat_map(|i| cluster.store.records(WorkerId::new(i).unwrap()).unwrap())
        .map(|record| record.value)
        .sum();
    assert_eq!(logged, 13);
}

#[tokio::test]
async fn test_stats_matches_logs() {
    let cluster = start_cluster(2).await;
    for value in 1..=6 {
        call(&cluster.router, write(&value.to_string())).await;
    }
    drain(&cluster).await;

    let (status, body) = call(&cluster.router, get("/api/stats")).await;
    assert_eq!(status, StatusCode::OK);
    let rows = body["workers"].as_array().unwrap();
    let total: u64 = rows.iter().map(|row| row["items"].as_u64().unwrap()).sum();
    assert_eq!(total, 6);

    for row in rows {
        let id = WorkerId::new(row["workerId"].as_u64().unwrap() as u32).unwrap();
        let on_disk = cluster.store.records(id).unwrap().len() as u64;
        assert_eq!(row["items"].as_u64().unwrap(), on_disk);
    }
}

#[tokio::test]
async fn test_rejected_write_never_reaches_a_worker() {
    let cluster = start_cluster(1).await;
    let (status, body) = call(&cluster.router, write("\"abc\"")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "value must be integer");

    drain(&cluster).await;
    assert!(cluster.store.counts_by_worker().unwrap().is_empty());
}

#[tokio::test]
async fn test_crashed_worker_drops_out_of_sums() {
    let mut cluster = start_cluster(2).await;
    for value in [4, 4, 4, 4] {
        call(&cluster.router, write(&value.to_string())).await;
    }
    drain(&cluster).await;

    let crashed = cluster.workers.remove(1);
    let crashed_sum = cluster.store.sum_for(crashed.id()).unwrap();
    crashed.abort();
    crashed.join().await.unwrap();

    let (_, body) = call(&cluster.router, get("/api/sum")).await;
    assert_eq!(body["respondedCount"], 1);
    assert_eq!(body["total"], 16 - crashed_sum);

    // A new worker with the same id picks its partial sum back up from disk
    let conn = Connection::connect(cluster.addr).await.unwrap();
    let _restarted = WorkerNode::new(WorkerId::new(2).unwrap(), conn, cluster.store.clone())
        .start()
        .await
        .unwrap();
    let (_, body) = call(&cluster.router, get("/api/sum")).await;
    assert_eq!(body["respondedCount"], 2);
    assert_eq!(body["total"], 16);
}

#[test]
fn test_worker_without_id_refuses_to_start() {
    assert!(WorkerConfig::default().validate().is_err());
    let config = WorkerConfig {
        worker_id: Some(0),
        ..Default::default()
    };
    assert!(config.validate().is_err());
}
