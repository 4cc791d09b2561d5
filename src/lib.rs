//! # fansum
//!
//! Scatter-gather integer aggregation:
//! - writes go through a durable work queue and are persisted by exactly one
//!   worker, acknowledged only after they hit storage
//! - a sum request fans out to every live worker, each answers with its
//!   partial sum, and the coordinator adds up the replies that arrive within
//!   a fixed window
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────┐
//! │              Coordinator               │
//! │  HTTP API · broker · worker supervisor │
//! └─────┬────────────────┬─────────────▲───┘
//!       │ writes.q       │ sum.fanout  │ replies to a
//!       │ (one worker)   │ (every one) │ private queue
//!   ┌───▼──────────┐ ┌───▼──────────┐  │
//!   │ Worker 1..N  │ │ Worker 1..N  ├──┘
//!   │ worker-N.log │ │ partial sum  │
//!   └──────────────┘ └──────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a coordinator (spawns its workers)
//! ```bash
//! fansum-coord serve --workers 3 --http 0.0.0.0:3000 --data ./data
//! ```
//!
//! ### Start a worker by hand
//! ```bash
//! fansum-worker --id 4 --broker 127.0.0.1:5673 --data-dir ./data
//! ```
//!
//! ### Use the CLI
//! ```bash
//! fansum write 5
//! fansum sum
//! fansum stats
//! ```

pub mod broker;
pub mod common;
pub mod coordinator;
pub mod ops;
pub mod queue;
pub mod store;
pub mod worker;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::Coordinator;
pub use worker::WorkerNode;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
