//! # mux-client
//!
//! Duplex JSON-RPC client over one shared, lazily opened connection:
//!
//! - **Client** (`client`) — `DuplexClient::subscribe` / `invoke` / `dispose`
//! - **Lifecycle** (`lifecycle`) — connect, heartbeat, reconnect with backoff, replay
//! - **Queue** (`queue`) — FIFO buffer for requests issued while not connected
//! - **Correlator** (`correlator`) — request id → waiting caller
//! - **Registry** (`registry`) — channel → ref-counted push handlers
//! - **Dispatcher** (`dispatcher`) — routes inbound frames to correlator or registry
//! - **Invoker** (`invoker`) — where push handlers execute
//!
//! ```no_run
//! use mux_client::DuplexClient;
//! use mux_core::config::{ClientConfig, Environment};
//!
//! # async fn run() -> Result<(), mux_core::MuxError> {
//! let client = DuplexClient::new(ClientConfig {
//!     environment: Some(Environment::Testnet),
//!     ..ClientConfig::default()
//! })?;
//! let _ticker = client.subscribe("ticker.BTC-PERPETUAL.100ms", |push| {
//!     println!("{}: {}", push.channel, push.data);
//! })?;
//! let time = client.invoke("public/get_time", serde_json::json!({})).await?;
//! println!("server time {time}");
//! client.dispose().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod correlator;
pub mod dispatcher;
pub mod invoker;
pub mod lifecycle;
pub mod queue;
pub mod registry;

#[cfg(test)]
mod mock;

pub use client::{ClientBuilder, DuplexClient, Subscription};
pub use invoker::{ChannelInvoker, DeliveryPump, HandlerInvoker, InlineInvoker};
pub use lifecycle::{Backoff, ConnectionState, ConnectionStats};
pub use registry::{HandlerId, PushHandler};
