//! Error types shared across the messaging and cache layers.
//!
//! `TransportError` is what a broker client reports; `MessagingError` is what
//! the Connection Manager, Publisher and Consumer Registry hand back to
//! callers. None of these are meant to crash the host process: call sites
//! log them and carry on in degraded mode.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("channel is closed")]
    ChannelClosed,
}

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("message broker is not connected")]
    NotConnected,

    #[error("failed to connect to message broker: {0}")]
    Connection(#[source] TransportError),

    #[error("failed to declare {entity}: {source}")]
    Topology {
        entity: String,
        #[source]
        source: TransportError,
    },

    #[error("failed to publish to {target}: {source}")]
    Publish {
        target: String,
        #[source]
        source: TransportError,
    },

    #[error("failed to consume from {queue}: {source}")]
    Consume {
        queue: String,
        #[source]
        source: TransportError,
    },

    #[error("failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("payload must serialize to a JSON object, got {0}")]
    InvalidPayload(&'static str),
}

impl MessagingError {
    /// True when the error is the disconnected short-circuit rather than a
    /// broker-side failure.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, MessagingError::NotConnected)
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache is not connected")]
    NotConnected,

    #[error("cache store error: {0}")]
    Store(#[from] sled::Error),

    #[error("cache value is not valid json: {0}")]
    Serialization(#[from] serde_json::Error),
}
