//! Coordinator
//!
//! Hosts the broker, starts the workers and serves the HTTP API:
//! - writes go to the durable `writes.q` queue, one worker persists each
//! - sums fan out to every live worker and gather replies for a fixed window

pub mod aggregate;
pub mod http;
pub mod server;
pub mod supervisor;

pub use aggregate::{Clock, ReplyTally, SumCoordinator, TokioClock};
pub use server::Coordinator;
pub use supervisor::Supervisor;
