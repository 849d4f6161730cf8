//! Error types for the host network layer.

use std::io;

use thiserror::Error;

use crate::net::connection::ConnectionState;

/// Errors that abort a network start.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Neither the preferred nor an ephemeral port could be bound.
    #[error("failed to bind listener on port {port} or an ephemeral port: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// The background thread or its runtime could not be created.
    #[error("failed to launch network worker: {0}")]
    Worker(#[from] io::Error),

    /// The worker exited before reporting that it was live.
    #[error("network worker exited during startup")]
    StartupAborted,
}

/// Errors raised by [`Connection`](crate::net::Connection).
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Operation requires a different lifecycle state.
    #[error("connection is {actual:?}, expected {expected:?}")]
    StateMismatch {
        expected: ConnectionState,
        actual: ConnectionState,
    },

    /// Outbound connect failed.
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    /// The socket was already released.
    #[error("connection is closed")]
    Closed,
}
