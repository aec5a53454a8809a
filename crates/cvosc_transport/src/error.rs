//! Transport error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to bind socket on {addr}: {source}")]
    BindError {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("socket send timed out")]
    SendTimeout,

    #[error("argument count mismatch: expected {expected}, got {got}")]
    SizeMismatch { expected: usize, got: usize },

    #[error("invalid OSC address: {0}")]
    InvalidAddress(String),

    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("failed to encode OSC packet: {0}")]
    Encode(String),

    #[error("failed to decode OSC packet: {0}")]
    Decode(String),

    #[error("no target configured")]
    NoTarget,
}

pub type TransportResult<T> = Result<T, TransportError>;
