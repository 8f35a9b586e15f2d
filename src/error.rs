//! Error types for queuewire.

use thiserror::Error;

use crate::protocol::{ConnectionError, PopError, PushError};

/// Main error type for all queuewire operations.
#[derive(Debug, Error)]
pub enum QueueWireError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error for typed payloads.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error for typed payloads.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// The byte stream cannot be framed (unknown packet tag, oversized body).
    #[error("Framing error: {0}")]
    Framing(String),

    /// A well-framed packet body is malformed.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A packet cannot be encoded (field too long for its length prefix).
    #[error("Encode error: {0}")]
    Encode(String),

    /// Connection closed, locally or by the peer.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The broker refused the connection handshake.
    #[error("Connection refused: {0}")]
    Connection(#[from] ConnectionError),

    /// A push request failed.
    #[error("Push failed: {0}")]
    Push(#[from] PushError),

    /// A pop request failed.
    #[error("Pop failed: {0}")]
    Pop(#[from] PopError),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Writer queue is full.
    #[error("Backpressure: writer queue is full")]
    Backpressure,

    /// An operation did not complete in time.
    #[error("Operation timed out")]
    Timeout,
}

/// Result type alias using QueueWireError.
pub type Result<T> = std::result::Result<T, QueueWireError>;
