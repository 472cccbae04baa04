//! Typed error definitions for the duplex client.
//!
//! [`MuxError`] carries both the failure kinds that reach `invoke` callers
//! (`Timeout`, `ConnectionLost`, `Remote`, `Disposed`) and the internal kinds
//! that are only ever logged (`Config`, `Transport`, `Protocol`). All variants
//! implement `std::error::Error` via `thiserror`, so they convert into
//! `anyhow::Error` at the binary edge.

use std::time::Duration;

use thiserror::Error;

use crate::envelope::RemoteError;

/// Domain-specific errors for the duplex client.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MuxError {
    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Connect, handshake, read or write failure on the physical connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// Frame that could not be encoded, parsed or classified.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No response arrived within the request deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The connection epoch ended while the request was in flight.
    #[error("connection lost before a response arrived")]
    ConnectionLost,

    /// The far end answered with an explicit error payload.
    #[error("remote error {}: {}", .0.code, .0.message)]
    Remote(RemoteError),

    /// The client was shut down.
    #[error("client disposed")]
    Disposed,
}

impl MuxError {
    /// Whether a caller may reasonably retry the operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, MuxError::Timeout(_) | MuxError::ConnectionLost)
    }
}

impl From<RemoteError> for MuxError {
    fn from(err: RemoteError) -> Self {
        MuxError::Remote(err)
    }
}
