//! In-memory transport for exercising the client without a network.
//!
//! Every successful `connect` hands the test a [`MockPeer`]: the frames the
//! client wrote, and a handle to feed frames back. Dropping the peer's
//! inbound handle ends the client's stream, which the client sees as a lost
//! connection.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Sink;
use mux_core::MuxError;
use mux_core::transport::{Connector, Link};
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};
use tokio::time::Sleep;

#[derive(Clone)]
pub(crate) struct MockConnector {
    peers: mpsc::UnboundedSender<MockPeer>,
    attempts: Arc<AtomicUsize>,
    refuse_next: Arc<AtomicUsize>,
    stall: Arc<AtomicBool>,
    close_delay_ms: Arc<AtomicU64>,
    close_started: Arc<Notify>,
}

impl MockConnector {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<MockPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let connector = Self {
            peers,
            attempts: Arc::new(AtomicUsize::new(0)),
            refuse_next: Arc::new(AtomicUsize::new(0)),
            stall: Arc::new(AtomicBool::new(false)),
            close_delay_ms: Arc::new(AtomicU64::new(0)),
            close_started: Arc::new(Notify::new()),
        };
        (connector, rx)
    }

    /// Fail the next `n` connection attempts.
    pub(crate) fn refuse(&self, n: usize) {
        self.refuse_next.store(n, Ordering::SeqCst);
    }

    /// Make connection attempts hang until the client gives up on them.
    pub(crate) fn stall(&self, on: bool) {
        self.stall.store(on, Ordering::SeqCst);
    }

    /// Make closing a connection from the client side take `delay`.
    pub(crate) fn slow_close(&self, delay: Duration) {
        self.close_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Signalled each time the client starts closing a connection.
    pub(crate) fn close_started(&self) -> Arc<Notify> {
        Arc::clone(&self.close_started)
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Link, MuxError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let refused = self
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(MuxError::Transport(format!("connection to {url} refused")));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Result<String, MuxError>>();

        let sink = MockSink {
            tx: out_tx,
            close_delay: Duration::from_millis(self.close_delay_ms.load(Ordering::SeqCst)),
            close_started: Arc::clone(&self.close_started),
            closing: None,
        };
        let stream = futures_util::stream::unfold(in_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        let _ = self.peers.send(MockPeer {
            url: url.to_string(),
            sent: out_rx,
            inbound: Some(in_tx),
        });
        Ok(Link::new(Box::pin(sink), Box::pin(stream)))
    }
}

/// Client-to-peer half. Closing may be slowed down to widen race windows.
struct MockSink {
    tx: mpsc::UnboundedSender<String>,
    close_delay: Duration,
    close_started: Arc<Notify>,
    closing: Option<Pin<Box<Sleep>>>,
}

impl Sink<String> for MockSink {
    type Error = MuxError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), MuxError>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, text: String) -> Result<(), MuxError> {
        self.tx
            .send(text)
            .map_err(|_| MuxError::Transport("peer gone".into()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), MuxError>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), MuxError>> {
        let this = self.get_mut();
        if this.closing.is_none() {
            this.close_started.notify_one();
            this.closing = Some(Box::pin(tokio::time::sleep(this.close_delay)));
        }
        match this.closing.as_mut() {
            Some(delay) => delay.as_mut().poll(cx).map(Ok),
            None => Poll::Ready(Ok(())),
        }
    }
}

/// Server side of one mock connection.
pub(crate) struct MockPeer {
    pub(crate) url: String,
    sent: mpsc::UnboundedReceiver<String>,
    inbound: Option<mpsc::UnboundedSender<Result<String, MuxError>>>,
}

impl MockPeer {
    /// Next frame written by the client, parsed. `None` once the client has
    /// dropped its end.
    pub(crate) async fn recv(&mut self) -> Option<Value> {
        let text = self.sent.recv().await?;
        Some(serde_json::from_str(&text).expect("client wrote invalid JSON"))
    }

    /// A frame already written, without waiting.
    pub(crate) fn try_recv(&mut self) -> Option<Value> {
        let text = self.sent.try_recv().ok()?;
        Some(serde_json::from_str(&text).expect("client wrote invalid JSON"))
    }

    pub(crate) fn send_raw(&self, text: &str) {
        if let Some(tx) = &self.inbound {
            let _ = tx.send(Ok(text.to_string()));
        }
    }

    pub(crate) fn respond(&self, id: u64, result: Value) {
        self.send_raw(&json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string());
    }

    pub(crate) fn respond_error(&self, id: u64, code: i64, message: &str) {
        self.send_raw(
            &json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
                .to_string(),
        );
    }

    pub(crate) fn push(&self, channel: &str, data: Value) {
        self.send_raw(
            &json!({
                "jsonrpc": "2.0",
                "method": "subscription",
                "params": {"channel": channel, "data": data}
            })
            .to_string(),
        );
    }

    /// Inject a transport error into the client's stream.
    pub(crate) fn fail(&self, reason: &str) {
        if let Some(tx) = &self.inbound {
            let _ = tx.send(Err(MuxError::Transport(reason.to_string())));
        }
    }

    /// Close the server side; the client's stream ends.
    pub(crate) fn hang_up(&mut self) {
        self.inbound = None;
    }
}

/// Id of a client frame.
pub(crate) fn frame_id(frame: &Value) -> u64 {
    frame["id"].as_u64().expect("frame without numeric id")
}
