//! Error handling for the konnect protocol crate.
//!
//! All fallible operations return [`Result`]; underlying library errors are
//! converted automatically via `thiserror`.

use thiserror::Error;

/// Errors produced by the protocol implementation.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    #[error("TLS error: {0}")]
    Tls(#[from] openssl::error::ErrorStack),

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("peer {0} uses an unsupported protocol version {1}")]
    UnsupportedProtocolVersion(String, i64),

    #[error("device {0} is not paired")]
    NotPaired(String),

    #[error("device {0} is not reachable")]
    NotReachable(String),

    #[error("no free transfer port available")]
    PortsExhausted,

    #[error("payload size mismatch: expected {expected} bytes, received {received}")]
    PayloadSizeMismatch { expected: u64, received: u64 },

    #[error("connection closed by peer")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
