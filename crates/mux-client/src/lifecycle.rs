//! Connection lifecycle: state machine, driver task, heartbeat and backoff.
//!
//! A single driver task per client owns the physical connection. It runs
//! one loop iteration per connection epoch:
//!
//! 1. Connects through the [`Connector`] (bounded by the connect timeout).
//! 2. On success, under the slot lock: marks the slot `Open`, flushes the
//!    outbound queue in FIFO order, and sends one batched activation for
//!    every subscribed channel. Starts the heartbeat.
//! 3. Reads frames in arrival order and hands each to the [`Dispatcher`],
//!    writes outbound frames, sweeps expired requests, closes when idle.
//! 4. On disconnect: fails every pending request, then reconnects with
//!    exponential backoff, but only while at least one channel is subscribed.
//!
//! Every mutation that must be atomic with respect to the connection state
//! (queueing vs. writing, registering a channel vs. replaying the registry,
//! failing pending requests vs. purging queued envelopes) happens under the
//! one slot lock. Lock order is always slot → registry/correlator.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use mux_core::config::ClientConfig;
use mux_core::envelope::channels_params;
use mux_core::transport::{Connector, Link};
use mux_core::{MuxError, WireFormat};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::correlator::{RequestCorrelator, RequestOutcome};
use crate::dispatcher::Dispatcher;
use crate::invoker::HandlerInvoker;
use crate::queue::OutboundQueue;
use crate::registry::{HandlerId, PushHandler, Removal, SubscriptionRegistry};

/// How often an open connection sweeps expired requests and checks idleness.
const HOUSEKEEPING_PERIOD: Duration = Duration::from_secs(1);

/// Lifecycle state of the physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a client, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    /// Number of connection attempts so far.
    pub epoch: u64,
    pub pending_requests: usize,
    pub queued_messages: usize,
    pub channels: usize,
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential reconnect delay: `base, 2·base, 4·base, …` capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    /// Delay to wait now; doubles the delay for the next call.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

/// Why an epoch ended.
#[derive(Debug)]
enum EpochEnd {
    /// Disposal was requested.
    Shutdown,
    /// Transport failure, peer close, or heartbeat flatline.
    Lost(String),
    /// Closed for lack of use.
    Idle,
}

impl fmt::Display for EpochEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpochEnd::Shutdown => f.write_str("shutdown"),
            EpochEnd::Lost(reason) => f.write_str(reason),
            EpochEnd::Idle => f.write_str("idle"),
        }
    }
}

/// Connection state guarded by the slot lock.
struct ConnectionSlot {
    state: ConnectionState,
    epoch: u64,
    /// Writer for the current epoch; `Some` only while `Open`.
    outbound: Option<mpsc::UnboundedSender<String>>,
    queue: OutboundQueue,
    driver: Option<JoinHandle<()>>,
    /// A driver task is running (connecting, open, or waiting to reconnect).
    driver_active: bool,
    disposed: bool,
}

/// Owns the connection and orchestrates queue, correlator and registry.
pub struct ConnectionManager {
    config: ClientConfig,
    url: String,
    connector: Arc<dyn Connector>,
    wire: Arc<dyn WireFormat>,
    correlator: Arc<RequestCorrelator>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Dispatcher,
    slot: Mutex<ConnectionSlot>,
    shutdown_tx: watch::Sender<bool>,
}

impl ConnectionManager {
    /// Validate `config` and build an idle manager. Nothing connects until
    /// the first subscribe or request.
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        wire: Arc<dyn WireFormat>,
        invoker: Arc<dyn HandlerInvoker>,
    ) -> Result<Arc<Self>, MuxError> {
        config.validate()?;
        let url = config.endpoint()?;
        let correlator = Arc::new(RequestCorrelator::new());
        let registry = Arc::new(SubscriptionRegistry::new());
        let dispatcher = Dispatcher::new(
            Arc::clone(&wire),
            Arc::clone(&correlator),
            Arc::clone(&registry),
            invoker,
        );
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            url,
            connector,
            wire,
            correlator,
            registry,
            dispatcher,
            slot: Mutex::new(ConnectionSlot {
                state: ConnectionState::Disconnected,
                epoch: 0,
                outbound: None,
                queue: OutboundQueue::new(),
                driver: None,
                driver_active: false,
                disposed: false,
            }),
            shutdown_tx,
        }))
    }

    pub fn state(&self) -> ConnectionState {
        self.slot.lock().state
    }

    pub fn is_disposed(&self) -> bool {
        self.slot.lock().disposed
    }

    pub fn stats(&self) -> ConnectionStats {
        let slot = self.slot.lock();
        ConnectionStats {
            state: slot.state,
            epoch: slot.epoch,
            pending_requests: self.correlator.len(),
            queued_messages: slot.queue.len(),
            channels: self.registry.len(),
        }
    }

    /// Start the driver unless one is already connecting, open, or waiting
    /// to reconnect. Must be called from within a tokio runtime.
    pub fn ensure_connected(self: &Arc<Self>) {
        let mut slot = self.slot.lock();
        self.ensure_connected_locked(&mut slot);
    }

    fn ensure_connected_locked(self: &Arc<Self>, slot: &mut ConnectionSlot) {
        if slot.disposed || slot.driver_active {
            return;
        }
        slot.driver_active = true;
        slot.state = ConnectionState::Connecting;
        let shutdown = self.shutdown_tx.subscribe();
        slot.driver = Some(tokio::spawn(Arc::clone(self).drive(shutdown)));
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    /// Issue `method` and wait for its outcome, bounded by the request timeout.
    pub async fn request(self: &Arc<Self>, method: &str, params: Value) -> Result<Value, MuxError> {
        let timeout = self.config.request_timeout();
        let (id, mut rx) = self.submit(method, &params, timeout)?;

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without an outcome: the table was torn down.
            Ok(Err(_)) => Err(MuxError::ConnectionLost),
            Err(_) => {
                if self.abandon(id) {
                    debug!("[mux-client] {method} (id={id}) timed out after {timeout:?}");
                    Err(MuxError::Timeout(timeout))
                } else {
                    // Resolved concurrently with the deadline firing.
                    rx.try_recv().unwrap_or(Err(MuxError::Timeout(timeout)))
                }
            }
        }
    }

    /// Register, frame, and write-or-queue a request.
    fn submit(
        self: &Arc<Self>,
        method: &str,
        params: &Value,
        timeout: Duration,
    ) -> Result<(u64, oneshot::Receiver<RequestOutcome>), MuxError> {
        let mut slot = self.slot.lock();
        if slot.disposed {
            return Err(MuxError::Disposed);
        }
        let (id, rx) = self.correlator.register(method, timeout);
        let text = match self.wire.encode_request(id, method, params) {
            Ok(text) => text,
            Err(e) => {
                self.correlator.abandon(id);
                return Err(e);
            }
        };
        Self::write_or_queue(&mut slot, id, text);
        self.ensure_connected_locked(&mut slot);
        Ok((id, rx))
    }

    /// Write immediately when open, otherwise append to the queue.
    fn write_or_queue(slot: &mut ConnectionSlot, id: u64, text: String) {
        match (slot.state, &slot.outbound) {
            (ConnectionState::Open, Some(tx)) => {
                // A closed writer means the epoch is ending; its teardown
                // fails this request.
                let _ = tx.send(text);
            }
            _ => slot.queue.push(id, text),
        }
    }

    /// Drop a timed-out request from the table and, if still there, the queue.
    fn abandon(&self, id: u64) -> bool {
        let mut slot = self.slot.lock();
        slot.queue.remove(id);
        self.correlator.abandon(id)
    }

    /// Fire-and-forget control request on an open connection.
    fn send_control(&self, tx: &mpsc::UnboundedSender<String>, method: &str, channels: &[String]) {
        let id = self
            .correlator
            .register_detached(method, self.config.request_timeout());
        match self.wire.encode_request(id, method, &channels_params(channels)) {
            Ok(text) => {
                let _ = tx.send(text);
            }
            Err(e) => {
                self.correlator.abandon(id);
                warn!("[mux-client] failed to frame {method}: {e}");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Register a handler. Activation goes out now if the connection is open,
    /// otherwise with the batched activation when it opens.
    pub fn subscribe(self: &Arc<Self>, channel: &str, handler: PushHandler) -> Result<HandlerId, MuxError> {
        let mut slot = self.slot.lock();
        if slot.disposed {
            return Err(MuxError::Disposed);
        }
        let (id, first) = self.registry.add(channel, handler);
        if first {
            debug!("[mux-client] activating channel '{channel}'");
            if let (ConnectionState::Open, Some(tx)) = (slot.state, &slot.outbound) {
                self.send_control(tx, &self.config.subscribe_method, &[channel.to_string()]);
            }
        }
        self.ensure_connected_locked(&mut slot);
        Ok(id)
    }

    /// Remove a handler; the last one out deactivates the channel.
    pub fn unsubscribe(&self, channel: &str, id: HandlerId) {
        let slot = self.slot.lock();
        if self.registry.remove(channel, id) == Removal::Last {
            debug!("[mux-client] deactivating channel '{channel}'");
            if let (ConnectionState::Open, Some(tx)) = (slot.state, &slot.outbound) {
                self.send_control(tx, &self.config.unsubscribe_method, &[channel.to_string()]);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Disposal
    // -----------------------------------------------------------------------

    /// Mark the manager disposed, fail all pending work, release every
    /// channel, and signal the driver. Returns the driver task, if any, so
    /// the caller may await it. Idempotent.
    pub fn shutdown(&self) -> Option<JoinHandle<()>> {
        let mut slot = self.slot.lock();
        if slot.disposed {
            return None;
        }
        slot.disposed = true;
        let was_open = slot.state == ConnectionState::Open;
        if slot.state != ConnectionState::Disconnected {
            slot.state = ConnectionState::Closing;
        }

        let dropped = slot.queue.clear();
        let failed = self.correlator.fail_all(|| MuxError::Disposed);
        let channels = self.registry.clear();
        if was_open && !channels.is_empty() {
            if let Some(tx) = &slot.outbound {
                self.send_control(tx, &self.config.unsubscribe_method, &channels);
            }
        }
        slot.outbound = None;
        self.shutdown_tx.send_replace(true);

        info!(
            "[mux-client] disposing: {failed} pending request(s) failed, {dropped} queued message(s) dropped, {} channel(s) released",
            channels.len()
        );
        slot.driver.take()
    }

    /// [`shutdown`](Self::shutdown) and wait for the driver to exit.
    ///
    /// Do not await this from inside a push handler run by the driver task;
    /// the driver would be waiting on itself.
    pub async fn dispose(&self) {
        if let Some(task) = self.shutdown() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("[mux-client] driver task panicked: {e}");
                }
            }
        }
        self.slot.lock().state = ConnectionState::Disconnected;
    }

    // -----------------------------------------------------------------------
    // Driver
    // -----------------------------------------------------------------------

    /// Connect, run and reconnect until disposed or no longer needed.
    async fn drive(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(self.config.backoff_base(), self.config.backoff_max());

        loop {
            let Some(epoch) = self.begin_attempt() else {
                return;
            };
            info!("[mux-client] epoch {epoch}: connecting to {}", self.url);

            let connect_timeout = self.config.connect_timeout();
            let attempt = tokio::select! {
                result = tokio::time::timeout(connect_timeout, self.connector.connect(&self.url)) => result,
                _ = shutdown.changed() => break,
            };

            let end = match attempt {
                Ok(Ok(link)) => self.run_epoch(epoch, link, &mut shutdown, &mut backoff).await,
                Ok(Err(e)) => {
                    error!("[mux-client] epoch {epoch}: connection failed: {e}");
                    EpochEnd::Lost(e.to_string())
                }
                Err(_) => {
                    error!("[mux-client] epoch {epoch}: connect timed out after {connect_timeout:?}");
                    EpochEnd::Lost(format!("connect timed out after {connect_timeout:?}"))
                }
            };
            if let EpochEnd::Shutdown = end {
                break;
            }

            if !self.end_epoch(epoch, &end) {
                return;
            }
            let delay = backoff.next_delay();
            warn!("[mux-client] epoch {epoch} ended ({end}), reconnecting in {delay:?}");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {},
                _ = shutdown.changed() => break,
            }
        }

        self.finish_shutdown();
    }

    /// Enter `Connecting` for a new epoch, or stop the driver when disposed
    /// or when there is nothing left to connect for.
    fn begin_attempt(&self) -> Option<u64> {
        let mut slot = self.slot.lock();
        let idle = self.registry.is_empty() && slot.queue.is_empty();
        if slot.disposed || idle {
            if idle && !slot.disposed {
                debug!("[mux-client] nothing to connect for; driver stopping");
            }
            slot.state = ConnectionState::Disconnected;
            slot.driver_active = false;
            return None;
        }
        slot.state = ConnectionState::Connecting;
        slot.epoch += 1;
        Some(slot.epoch)
    }

    /// `Connecting → Open`: flush the queue, then replay the registry.
    fn open_epoch(&self, epoch: u64, tx: mpsc::UnboundedSender<String>) -> bool {
        let mut slot = self.slot.lock();
        if slot.disposed {
            return false;
        }
        slot.state = ConnectionState::Open;

        let flushed = slot.queue.len();
        for message in slot.queue.drain() {
            let _ = tx.send(message.text);
        }
        let channels = self.registry.channels();
        if !channels.is_empty() {
            self.send_control(&tx, &self.config.subscribe_method, &channels);
        }
        slot.outbound = Some(tx);

        info!(
            "[mux-client] epoch {epoch}: open (flushed {flushed} queued, activating {} channel(s))",
            channels.len()
        );
        true
    }

    /// Run one open connection until it ends.
    async fn run_epoch(
        self: &Arc<Self>,
        epoch: u64,
        link: Link,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut Backoff,
    ) -> EpochEnd {
        let Link {
            mut sink,
            mut stream,
        } = link;
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        if !self.open_epoch(epoch, tx) {
            let _ = sink.close().await;
            return EpochEnd::Shutdown;
        }
        backoff.reset();

        let flatline = Arc::new(Notify::new());
        let heartbeat = self.spawn_heartbeat(epoch, Arc::clone(&flatline));
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_PERIOD);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut idle_since: Option<Instant> = None;

        let end = loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    // Best-effort flush of what disposal queued (deactivation).
                    while let Ok(text) = rx.try_recv() {
                        if sink.send(text).await.is_err() {
                            break;
                        }
                    }
                    let _ = sink.close().await;
                    break EpochEnd::Shutdown;
                }

                frame = stream.next() => match frame {
                    Some(Ok(text)) => {
                        self.dispatcher.dispatch(&text);
                    }
                    Some(Err(e)) => {
                        error!("[mux-client] epoch {epoch}: {e}");
                        break EpochEnd::Lost(e.to_string());
                    }
                    None => {
                        warn!("[mux-client] epoch {epoch}: stream ended");
                        break EpochEnd::Lost("stream ended".into());
                    }
                },

                Some(text) = rx.recv() => {
                    if let Err(e) = sink.send(text).await {
                        error!("[mux-client] epoch {epoch}: {e}");
                        break EpochEnd::Lost(e.to_string());
                    }
                }

                _ = flatline.notified() => {
                    warn!("[mux-client] epoch {epoch}: heartbeat flatlined, closing");
                    let _ = sink.close().await;
                    break EpochEnd::Lost("heartbeat failed".into());
                }

                _ = housekeeping.tick() => {
                    let now = Instant::now();
                    let expired = self.correlator.sweep_expired(now);
                    if expired > 0 {
                        debug!("[mux-client] epoch {epoch}: {expired} request(s) expired");
                    }
                    if let Some(limit) = self.config.idle_timeout() {
                        if self.is_idle() {
                            let since = *idle_since.get_or_insert(now);
                            if now.duration_since(since) >= limit {
                                if self.begin_idle_close() {
                                    info!("[mux-client] epoch {epoch}: idle for {limit:?}, closing");
                                    let _ = sink.close().await;
                                    break EpochEnd::Idle;
                                }
                                idle_since = None;
                            }
                        } else {
                            idle_since = None;
                        }
                    }
                }
            }
        };

        if let Some(task) = heartbeat {
            task.abort();
        }
        end
    }

    /// No channels, no requests in flight, nothing queued.
    fn is_idle(&self) -> bool {
        let slot = self.slot.lock();
        slot.queue.is_empty() && self.registry.is_empty() && self.correlator.is_empty()
    }

    /// `Open → Closing` for an idle close, decided under the slot lock so a
    /// subscribe or request racing the close is queued for the next epoch
    /// instead of written to this one.
    fn begin_idle_close(&self) -> bool {
        let mut slot = self.slot.lock();
        let idle =
            slot.queue.is_empty() && self.registry.is_empty() && self.correlator.is_empty();
        if idle {
            slot.state = ConnectionState::Closing;
            slot.outbound = None;
        }
        idle
    }

    /// `Connecting|Open → Disconnected`. Returns whether to reconnect; when
    /// not, the driver is marked inactive in the same critical section.
    fn end_epoch(&self, epoch: u64, end: &EpochEnd) -> bool {
        let mut slot = self.slot.lock();
        slot.outbound = None;
        slot.state = ConnectionState::Disconnected;

        let disposed = slot.disposed;
        // An idle close had nothing in flight; whatever is queued arrived
        // during the close and belongs to the next epoch.
        let carry_over = !disposed && matches!(end, EpochEnd::Idle);
        if !carry_over {
            let purged = slot.queue.clear();
            let failed = self.correlator.fail_all(|| {
                if disposed {
                    MuxError::Disposed
                } else {
                    MuxError::ConnectionLost
                }
            });
            if failed > 0 || purged > 0 {
                warn!(
                    "[mux-client] epoch {epoch}: {failed} pending request(s) failed, {purged} queued envelope(s) purged"
                );
            }
        }

        let reconnect = !disposed && (!self.registry.is_empty() || !slot.queue.is_empty());
        if !reconnect {
            info!("[mux-client] epoch {epoch} ended ({end}); not reconnecting");
            slot.driver_active = false;
        }
        reconnect
    }

    /// Final teardown after a shutdown signal.
    fn finish_shutdown(&self) {
        let mut slot = self.slot.lock();
        slot.outbound = None;
        slot.state = ConnectionState::Disconnected;
        slot.driver_active = false;
        slot.queue.clear();
        self.correlator.fail_all(|| MuxError::Disposed);
        info!("[mux-client] driver stopped");
    }

    /// Periodic liveness check for one epoch. Notifies `flatline` after
    /// `heartbeat_max_failures` consecutive failures.
    fn spawn_heartbeat(self: &Arc<Self>, epoch: u64, flatline: Arc<Notify>) -> Option<JoinHandle<()>> {
        let period = self.config.heartbeat_interval()?;
        let max_failures = self.config.heartbeat_max_failures;
        let manager = Arc::clone(self);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // skip the immediate first tick

            let mut failures = 0u32;
            loop {
                ticker.tick().await;
                let method = manager.config.heartbeat_method.clone();
                match manager.request(&method, serde_json::json!({})).await {
                    // An error reply still proves the peer is alive.
                    Ok(_) | Err(MuxError::Remote(_)) => failures = 0,
                    Err(MuxError::Disposed) => break,
                    Err(e) => {
                        failures += 1;
                        warn!(
                            "[mux-client] epoch {epoch}: heartbeat failed ({failures}/{max_failures}): {e}"
                        );
                        if failures >= max_failures {
                            flatline.notify_one();
                            break;
                        }
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        let delays: Vec<u64> = (0..6).map(|_| b.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn backoff_reset_returns_to_base() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_secs(30));
        b.next_delay();
        b.next_delay();
        assert_eq!(b.current(), Duration::from_millis(400));
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn state_display() {
        assert_eq!(ConnectionState::Open.to_string(), "open");
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
    }
}
