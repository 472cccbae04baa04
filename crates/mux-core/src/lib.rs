//! # mux-core
//!
//! Shared building blocks for the duplex JSON-RPC client:
//!
//! - **Configuration** (`config`) — JSON client/runner config with defaults
//! - **Error types** (`error`) — `MuxError` via thiserror
//! - **Envelope** (`envelope`) — request encoding and inbound frame classification
//! - **Transport** (`transport`) — `Connector` boundary + WebSocket implementation
//! - **Logging** (`logging`) — tracing-based structured logging

pub mod config;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod transport;

pub use envelope::{Inbound, JsonRpc, Push, RemoteError, WireFormat};
pub use error::MuxError;
