//! Error types for fansum

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Encoding Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    // === Broker Errors ===
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    #[error("Resource locked: {0}")]
    ResourceLocked(String),

    #[error("Publish rejected: {0}")]
    Backpressure(String),

    #[error("Unknown delivery tag: {0}")]
    UnknownDeliveryTag(u64),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Broker error: {0}")]
    Broker(String),

    // === HTTP Client Errors ===
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    // === Storage Errors ===
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// Covers a broker that is not up yet or went away mid-handshake.
    pub fn is_retryable(&self) -> bool {
        use std::io::ErrorKind;
        match self {
            Error::Backpressure(_) | Error::ConnectionClosed => true,
            Error::Io(e) => matches!(
                e.kind(),
                ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected
                    | ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Is this fatal to the messaging role that hit it?
    pub fn is_transport_fault(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed | Error::ChannelClosed | Error::Io(_) | Error::Codec(_)
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::MalformedMessage(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::Backpressure(_) | Error::ConnectionClosed | Error::ChannelClosed => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

/// Broker failure as carried over the wire.
///
/// Keeps the variants a remote client needs to react to; everything else
/// collapses into `Other` with its message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteError {
    QueueNotFound(String),
    ExchangeNotFound(String),
    ResourceLocked(String),
    Backpressure(String),
    UnknownDeliveryTag(u64),
    ChannelClosed,
    Other(String),
}

impl From<&Error> for RemoteError {
    fn from(e: &Error) -> Self {
        match e {
            Error::QueueNotFound(q) => RemoteError::QueueNotFound(q.clone()),
            Error::ExchangeNotFound(x) => RemoteError::ExchangeNotFound(x.clone()),
            Error::ResourceLocked(r) => RemoteError::ResourceLocked(r.clone()),
            Error::Backpressure(q) => RemoteError::Backpressure(q.clone()),
            Error::UnknownDeliveryTag(t) => RemoteError::UnknownDeliveryTag(*t),
            Error::ChannelClosed => RemoteError::ChannelClosed,
            other => RemoteError::Other(other.to_string()),
        }
    }
}

impl From<RemoteError> for Error {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::QueueNotFound(q) => Error::QueueNotFound(q),
            RemoteError::ExchangeNotFound(x) => Error::ExchangeNotFound(x),
            RemoteError::ResourceLocked(r) => Error::ResourceLocked(r),
            RemoteError::Backpressure(q) => Error::Backpressure(q),
            RemoteError::UnknownDeliveryTag(t) => Error::UnknownDeliveryTag(t),
            RemoteError::ChannelClosed => Error::ChannelClosed,
            RemoteError::Other(msg) => Error::Broker(msg),
        }
    }
}
