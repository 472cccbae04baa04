//! Execution strategy for push handlers.
//!
//! The dispatch path never calls a handler directly; it hands the handler and
//! the push to a [`HandlerInvoker`]. [`InlineInvoker`] runs it on the driver
//! task with panic isolation. [`ChannelInvoker`] forwards it to a
//! [`DeliveryPump`] owned by the application, so handlers can run on whatever
//! thread or event loop the application chooses.

use std::panic::{AssertUnwindSafe, catch_unwind};

use mux_core::Push;
use tokio::sync::mpsc;
use tracing::error;

use crate::registry::PushHandler;

/// Runs one handler for one push.
pub trait HandlerInvoker: Send + Sync + 'static {
    fn invoke(&self, handler: &PushHandler, push: &Push);
}

/// Run `handler`, containing any panic. Returns `false` if it panicked.
pub fn call_isolated(handler: &PushHandler, push: &Push) -> bool {
    match catch_unwind(AssertUnwindSafe(|| handler(push))) {
        Ok(()) => true,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!("[mux-client] handler for '{}' panicked: {reason}", push.channel);
            false
        }
    }
}

/// Calls handlers synchronously on the dispatch task.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineInvoker;

impl HandlerInvoker for InlineInvoker {
    fn invoke(&self, handler: &PushHandler, push: &Push) {
        call_isolated(handler, push);
    }
}

type Delivery = (PushHandler, Push);

/// Forwards deliveries to a [`DeliveryPump`].
pub struct ChannelInvoker {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl ChannelInvoker {
    pub fn new() -> (Self, DeliveryPump) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, DeliveryPump { rx })
    }
}

impl HandlerInvoker for ChannelInvoker {
    fn invoke(&self, handler: &PushHandler, push: &Push) {
        if self.tx.send((handler.clone(), push.clone())).is_err() {
            error!("[mux-client] delivery pump dropped; push for '{}' lost", push.channel);
        }
    }
}

/// Receiving end of a [`ChannelInvoker`]. Deliveries come out in dispatch
/// order.
pub struct DeliveryPump {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl DeliveryPump {
    /// Run every delivery already queued without waiting. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok((handler, push)) = self.rx.try_recv() {
            call_isolated(&handler, &push);
            ran += 1;
        }
        ran
    }

    /// Run deliveries until every [`ChannelInvoker`] is gone.
    pub async fn run(mut self) {
        while let Some((handler, push)) = self.rx.recv().await {
            call_isolated(&handler, &push);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn push(channel: &str) -> Push {
        Push {
            channel: channel.into(),
            data: serde_json::json!(1),
        }
    }

    fn panicking(_: &Push) {
        panic!("handler failure");
    }

    #[test]
    fn inline_invoker_contains_panics() {
        let bad: PushHandler = Arc::new(panicking);
        InlineInvoker.invoke(&bad, &push("x"));
        assert!(!call_isolated(&bad, &push("x")));
    }

    #[test]
    fn pump_runs_in_order() {
        let (invoker, mut pump) = ChannelInvoker::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: PushHandler = Arc::new(move |p: &Push| sink.lock().push(p.channel.clone()));

        invoker.invoke(&handler, &push("a"));
        invoker.invoke(&handler, &push("b"));
        assert!(seen.lock().is_empty());

        assert_eq!(pump.run_pending(), 2);
        assert_eq!(*seen.lock(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn pump_survives_panicking_handler() {
        let (invoker, pump) = ChannelInvoker::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let good: PushHandler = Arc::new(move |_: &Push| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let bad: PushHandler = Arc::new(panicking);

        invoker.invoke(&bad, &push("x"));
        invoker.invoke(&good, &push("x"));
        drop(invoker);
        pump.run().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
