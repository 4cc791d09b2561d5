//! Operator commands against a running coordinator

pub mod api;

pub use api::{ApiClient, StatsResponse, SumResponse, WriteResponse};
