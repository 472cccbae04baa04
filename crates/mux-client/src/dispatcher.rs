//! Inbound frame routing.
//!
//! ```text
//! text frame ──► WireFormat::decode ──┬─ Response{id} ─► RequestCorrelator::resolve
//!                                     ├─ Push{channel} ─► SubscriptionRegistry::fan_out
//!                                     └─ Unrecognized / parse error ─► dropped (logged)
//! ```
//!
//! The dispatcher holds no state of its own and never fails: one bad frame
//! must not stop the frames behind it.

use std::sync::Arc;

use mux_core::{Inbound, WireFormat};
use tracing::{debug, trace, warn};

use crate::correlator::RequestCorrelator;
use crate::invoker::HandlerInvoker;
use crate::registry::SubscriptionRegistry;

/// What happened to one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Matched a pending request.
    Resolved(u64),
    /// Response for an id nobody is waiting on.
    Orphaned(u64),
    /// Delivered to this many handlers of the channel.
    Delivered { channel: String, handlers: usize },
    /// Not routable (unparseable or unknown shape).
    Dropped,
}

pub struct Dispatcher {
    wire: Arc<dyn WireFormat>,
    correlator: Arc<RequestCorrelator>,
    registry: Arc<SubscriptionRegistry>,
    invoker: Arc<dyn HandlerInvoker>,
}

impl Dispatcher {
    pub fn new(
        wire: Arc<dyn WireFormat>,
        correlator: Arc<RequestCorrelator>,
        registry: Arc<SubscriptionRegistry>,
        invoker: Arc<dyn HandlerInvoker>,
    ) -> Self {
        Self {
            wire,
            correlator,
            registry,
            invoker,
        }
    }

    /// Classify and route a single inbound text frame.
    pub fn dispatch(&self, text: &str) -> Route {
        match self.wire.decode(text) {
            Ok(Inbound::Response { id, outcome }) => {
                if self.correlator.resolve(id, outcome) {
                    trace!("[mux-client] resolved id={id}");
                    Route::Resolved(id)
                } else {
                    Route::Orphaned(id)
                }
            }
            Ok(Inbound::Push(push)) => {
                let handlers = self.registry.fan_out(&push, self.invoker.as_ref());
                if handlers == 0 {
                    debug!("[mux-client] push for unsubscribed channel '{}'", push.channel);
                }
                Route::Delivered {
                    channel: push.channel,
                    handlers,
                }
            }
            Ok(Inbound::Unrecognized) => {
                debug!("[mux-client] unrecognized frame: {}", truncate(text, 256));
                Route::Dropped
            }
            Err(e) => {
                warn!("[mux-client] {e}; frame: {}", truncate(text, 256));
                Route::Dropped
            }
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::InlineInvoker;
    use mux_core::{JsonRpc, MuxError, Push};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        dispatcher: Dispatcher,
        correlator: Arc<RequestCorrelator>,
        registry: Arc<SubscriptionRegistry>,
    }

    fn fixture() -> Fixture {
        let correlator = Arc::new(RequestCorrelator::new());
        let registry = Arc::new(SubscriptionRegistry::new());
        let dispatcher = Dispatcher::new(
            Arc::new(JsonRpc),
            Arc::clone(&correlator),
            Arc::clone(&registry),
            Arc::new(InlineInvoker),
        );
        Fixture {
            dispatcher,
            correlator,
            registry,
        }
    }

    #[test]
    fn response_goes_to_correlator() {
        let f = fixture();
        let (id, mut rx) = f.correlator.register("public/get_time", Duration::from_secs(5));
        let frame = format!(r#"{{"jsonrpc":"2.0","id":{id},"result":1700000000000}}"#);

        assert_eq!(f.dispatcher.dispatch(&frame), Route::Resolved(id));
        assert_eq!(rx.try_recv().unwrap(), Ok(json!(1700000000000u64)));
    }

    #[test]
    fn error_response_reaches_caller_as_remote_error() {
        let f = fixture();
        let (id, mut rx) = f.correlator.register("private/buy", Duration::from_secs(5));
        let frame =
            format!(r#"{{"jsonrpc":"2.0","id":{id},"error":{{"code":10004,"message":"order_not_found"}}}}"#);

        assert_eq!(f.dispatcher.dispatch(&frame), Route::Resolved(id));
        match rx.try_recv().unwrap() {
            Err(MuxError::Remote(err)) => assert_eq!(err.code, 10004),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bare_string_error_still_resolves_the_request() {
        let f = fixture();
        let (id, mut rx) = f.correlator.register("private/sell", Duration::from_secs(5));
        let frame = format!(r#"{{"jsonrpc":"2.0","id":{id},"error":"internal_server_error"}}"#);

        assert_eq!(f.dispatcher.dispatch(&frame), Route::Resolved(id));
        assert!(f.correlator.is_empty());
        match rx.try_recv().unwrap() {
            Err(MuxError::Remote(err)) => {
                assert_eq!(err.code, -32603);
                assert_eq!(err.message, "internal_server_error");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn late_response_is_orphaned() {
        let f = fixture();
        assert_eq!(
            f.dispatcher.dispatch(r#"{"jsonrpc":"2.0","id":77,"result":true}"#),
            Route::Orphaned(77)
        );
    }

    #[test]
    fn push_goes_to_registry() {
        let f = fixture();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        f.registry
            .add("ticker.BTC", Arc::new(move |p: &Push| sink.lock().push(p.data.clone())));

        let route = f.dispatcher.dispatch(
            r#"{"jsonrpc":"2.0","method":"subscription","params":{"channel":"ticker.BTC","data":{"p":1}}}"#,
        );
        assert_eq!(
            route,
            Route::Delivered {
                channel: "ticker.BTC".into(),
                handlers: 1
            }
        );
        assert_eq!(*seen.lock(), vec![json!({"p": 1})]);
    }

    #[test]
    fn garbage_and_unknown_frames_are_dropped() {
        let f = fixture();
        assert_eq!(f.dispatcher.dispatch("{{{"), Route::Dropped);
        assert_eq!(f.dispatcher.dispatch(r#"{"hello":"world"}"#), Route::Dropped);
        // The dispatcher keeps working afterwards.
        let (id, _rx) = f.correlator.register("m", Duration::from_secs(5));
        assert_eq!(
            f.dispatcher.dispatch(&format!(r#"{{"id":{id},"result":null}}"#)),
            Route::Resolved(id)
        );
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééé", 3), "é");
    }
}
