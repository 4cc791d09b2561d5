//! Message bodies exchanged between the coordinator and the workers
//!
//! All bodies travel as JSON (`application/json`) so they stay readable
//! when inspecting a queue.

use crate::common::utils::parse_integer_value;
use crate::common::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Queue holding pending writes
pub const WRITES_QUEUE: &str = "writes.q";

/// Fanout exchange carrying sum requests
pub const SUM_EXCHANGE: &str = "sum.fanout";

pub const CONTENT_TYPE_JSON: &str = "application/json";

const SUM_REQUEST_KIND: &str = "sum";

/// Numeric identity of a worker (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(u32);

impl WorkerId {
    pub fn new(id: u32) -> Result<Self> {
        if id == 0 {
            return Err(Error::InvalidConfig("worker id must be >= 1".into()));
        }
        Ok(Self(id))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A value to be persisted by exactly one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub value: i64,
}

impl WriteRequest {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a queued body; anything but an integer `value` is malformed.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let doc: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| Error::MalformedMessage(format!("write body is not JSON: {}", e)))?;
        let raw = doc
            .get("value")
            .ok_or_else(|| Error::MalformedMessage("write body has no `value`".into()))?;
        let value = parse_integer_value(raw)
            .ok_or_else(|| Error::MalformedMessage(format!("`value` is not an integer: {}", raw)))?;
        Ok(Self { value })
    }
}

/// Broadcast asking every live worker for its partial sum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SumRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub correlation_token: String,
    pub reply_address: String,
}

impl SumRequest {
    pub fn new(correlation_token: impl Into<String>, reply_address: impl Into<String>) -> Self {
        Self {
            kind: SUM_REQUEST_KIND.to_string(),
            correlation_token: correlation_token.into(),
            reply_address: reply_address.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let req: SumRequest = serde_json::from_slice(body)
            .map_err(|e| Error::MalformedMessage(format!("sum request: {}", e)))?;
        if req.kind != SUM_REQUEST_KIND {
            return Err(Error::MalformedMessage(format!(
                "unexpected request type `{}`",
                req.kind
            )));
        }
        if req.correlation_token.is_empty() || req.reply_address.is_empty() {
            return Err(Error::MalformedMessage(
                "sum request without token or reply address".into(),
            ));
        }
        Ok(req)
    }
}

/// One worker's answer to one sum request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SumReply {
    pub worker_id: WorkerId,
    pub partial_sum: i64,
    pub correlation_token: String,
}

impl SumReply {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| Error::MalformedMessage(format!("sum reply: {}", e)))
    }
}

/// Outcome of one scatter-gather round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    pub total: i64,
    pub responded_count: usize,
    pub window_ms: u64,
}

/// A stored write, attributed to the worker that consumed it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedNumber {
    pub id: u64,
    pub worker_id: WorkerId,
    pub value: i64,
    pub created_at: DateTime<Utc>,
}

/// Row of the stats query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCount {
    pub worker_id: WorkerId,
    pub items: u64,
}
