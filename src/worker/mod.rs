//! Worker node
//!
//! Each worker runs two independent flows, each on its own broker channel:
//! - writes: consume `writes.q`, persist, acknowledge
//! - sums: answer `sum.fanout` broadcasts with this worker's partial sum

pub mod server;
pub mod sums;
pub mod writes;

pub use server::{WorkerHandle, WorkerNode};
