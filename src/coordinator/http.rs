//! HTTP API for the coordinator
//!
//! - `POST /api/write` `{"value": <integer>}` queues a write for one worker
//! - `GET /api/sum` runs one scatter-gather round
//! - `GET /api/stats` stored item counts per worker
//! - `GET /health`

use crate::common::{parse_integer_value, WriteRequest};
use crate::coordinator::aggregate::SumCoordinator;
use crate::queue::WorkQueue;
use crate::store::{run_blocking, NumberStore};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

const MAX_BODY_BYTES: usize = 64 * 1024;

/// Shared state of the HTTP handlers
#[derive(Clone)]
pub struct CoordState {
    pub work_queue: WorkQueue,
    pub sums: SumCoordinator,
    pub store: Arc<dyn NumberStore>,
    pub sum_window: Duration,
    pub workers: usize,
}

pub fn create_router(state: CoordState) -> Router {
    Router::new()
        .route("/api/write", post(write_value))
        .route("/api/sum", get(sum_values))
        .route("/api/stats", get(stats))
        .route("/health", get(health))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_body(status: StatusCode, message: impl std::fmt::Display) -> axum::response::Response {
    (
        status,
        Json(json!({ "ok": false, "error": message.to_string() })),
    )
        .into_response()
}

async fn write_value(State(state): State<CoordState>, body: Bytes) -> impl IntoResponse {
    let value = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|doc| doc.get("value").and_then(parse_integer_value));
    let Some(value) = value else {
        return error_body(StatusCode::BAD_REQUEST, "value must be integer");
    };

    match state.work_queue.enqueue(WriteRequest { value }).await {
        Ok(()) => {
            tracing::debug!(value, "write queued");
            (StatusCode::OK, Json(json!({ "ok": true, "value": value }))).into_response()
        }
        Err(e) => {
            tracing::error!(value, "failed to queue write: {}", e);
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

async fn sum_values(State(state): State<CoordState>) -> impl IntoResponse {
    match state.sums.request_sum_aggregate(state.sum_window).await {
        Ok(result) => (
            StatusCode::OK,
            Json(json!({
                "ok": true,
                "total": result.total,
                "respondedCount": result.responded_count,
                "windowMs": result.window_ms,
            })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("sum aggregation failed: {}", e);
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

async fn stats(State(state): State<CoordState>) -> impl IntoResponse {
    let store = state.store.clone();
    match run_blocking(move || store.counts_by_worker()).await {
        Ok(workers) => (
            StatusCode::OK,
            Json(json!({ "ok": true, "workers": workers })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("stats query failed: {}", e);
            error_body(e.to_http_status(), e)
        }
    }
}

async fn health(State(state): State<CoordState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "workers": state.workers,
        "sumWindowMs": state.sum_window.as_millis() as u64,
        "version": crate::VERSION,
    }))
}
