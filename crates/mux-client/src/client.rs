//! Public client API: `subscribe`, `invoke`, `dispose`.

use std::fmt;
use std::sync::{Arc, Weak};

use mux_core::config::ClientConfig;
use mux_core::transport::{Connector, WsConnector};
use mux_core::{JsonRpc, MuxError, Push, WireFormat};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::invoker::{HandlerInvoker, InlineInvoker};
use crate::lifecycle::{ConnectionManager, ConnectionState, ConnectionStats};
use crate::registry::{HandlerId, PushHandler};

/// Assembles a [`DuplexClient`]. Defaults: WebSocket transport, JSON-RPC 2.0
/// framing, handlers run inline on the connection task.
pub struct ClientBuilder {
    config: ClientConfig,
    connector: Option<Arc<dyn Connector>>,
    wire: Arc<dyn WireFormat>,
    invoker: Arc<dyn HandlerInvoker>,
}

impl ClientBuilder {
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn wire_format(mut self, wire: Arc<dyn WireFormat>) -> Self {
        self.wire = wire;
        self
    }

    pub fn invoker(mut self, invoker: Arc<dyn HandlerInvoker>) -> Self {
        self.invoker = invoker;
        self
    }

    /// Validate the config and build the client. Does not connect.
    pub fn build(self) -> Result<DuplexClient, MuxError> {
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WsConnector::new(self.config.extra_headers.clone())));
        let manager = ConnectionManager::new(self.config, connector, self.wire, self.invoker)?;
        Ok(DuplexClient { manager })
    }
}

/// Multiplexed duplex client over a single lazily opened connection.
///
/// The connection opens on the first `subscribe` or `invoke`, is re-established
/// with backoff while any channel is subscribed, and closes for good on
/// [`dispose`](Self::dispose) or drop.
pub struct DuplexClient {
    manager: Arc<ConnectionManager>,
}

impl DuplexClient {
    /// WebSocket client with default framing.
    pub fn new(config: ClientConfig) -> Result<Self, MuxError> {
        Self::builder(config).build()
    }

    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder {
            config,
            connector: None,
            wire: Arc::new(JsonRpc),
            invoker: Arc::new(InlineInvoker),
        }
    }

    /// Register `handler` for pushes on `channel`. The first handler on a
    /// channel activates it remotely; the returned guard releases the handler
    /// when dropped or [`unsubscribe`](Subscription::unsubscribe)d.
    pub fn subscribe<F>(&self, channel: &str, handler: F) -> Result<Subscription, MuxError>
    where
        F: Fn(&Push) + Send + Sync + 'static,
    {
        self.subscribe_handler(channel, Arc::new(handler))
    }

    pub fn subscribe_handler(&self, channel: &str, handler: PushHandler) -> Result<Subscription, MuxError> {
        let id = self.manager.subscribe(channel, handler)?;
        Ok(Subscription {
            manager: Arc::downgrade(&self.manager),
            channel: channel.to_string(),
            id,
            active: true,
        })
    }

    /// Call `method` and wait for its result.
    ///
    /// Fails with `Timeout` when no response arrives within the request
    /// timeout (whatever the connection state), `ConnectionLost` when the
    /// connection drops first, `Remote` when the peer answers with an error,
    /// and `Disposed` after [`dispose`](Self::dispose).
    pub async fn invoke(&self, method: &str, params: Value) -> Result<Value, MuxError> {
        self.manager.request(method, params).await
    }

    /// Typed [`invoke`](Self::invoke). Encoding or decoding failures surface
    /// as `Protocol` errors.
    pub async fn call<P, R>(&self, method: &str, params: &P) -> Result<R, MuxError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)
            .map_err(|e| MuxError::Protocol(format!("cannot encode params for {method}: {e}")))?;
        let result = self.invoke(method, params).await?;
        serde_json::from_value(result)
            .map_err(|e| MuxError::Protocol(format!("unexpected result for {method}: {e}")))
    }

    /// Deactivate every channel, fail outstanding requests with `Disposed`,
    /// close the connection, and wait for the connection task to stop.
    /// Later calls are no-ops.
    pub async fn dispose(&self) {
        self.manager.dispose().await;
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.manager.stats()
    }

    pub fn is_disposed(&self) -> bool {
        self.manager.is_disposed()
    }
}

impl Drop for DuplexClient {
    fn drop(&mut self) {
        // The driver finishes closing on its own.
        let _ = self.manager.shutdown();
    }
}

impl fmt::Debug for DuplexClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexClient")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Handle for one registered push handler.
#[must_use = "dropping a Subscription unsubscribes it"]
pub struct Subscription {
    manager: Weak<ConnectionManager>,
    channel: String,
    id: HandlerId,
    active: bool,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.unsubscribe(&self.channel, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}
