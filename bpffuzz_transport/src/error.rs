//! Error types for the execution transport.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode or decode a frame: {0}")]
    Codec(#[from] serde_cbor::Error),

    #[error("connection to {peer} failed: {reason}")]
    ConnectionFailed { peer: String, reason: String },

    /// No client registered under this kernel label.
    #[error("unknown client: {0}")]
    UnknownClient(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("operation timed out")]
    Timeout,

    /// The peer closed the connection before answering.
    #[error("connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, TransportError>;
