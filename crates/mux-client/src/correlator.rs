//! Request/response correlation.
//!
//! Every outbound request gets a fresh id from a monotonically increasing
//! counter and a [`PendingRequest`] entry keyed by that id. The entry leaves
//! the table exactly once: on a matching response, on its deadline, or when
//! the connection epoch is torn down.
//!
//! Ids are never reused for the lifetime of the client, so a late response
//! from a torn-down epoch can never be mistaken for a newer request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ahash::AHashMap;
use mux_core::{MuxError, RemoteError};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Final result delivered to a waiting caller.
pub type RequestOutcome = Result<Value, MuxError>;

/// Where the outcome of a request goes.
enum ResultSink {
    /// An `invoke` caller is awaiting the receiver half.
    Caller(oneshot::Sender<RequestOutcome>),
    /// Fire-and-forget control request; failures are only logged.
    Detached,
}

struct PendingRequest {
    method: String,
    sink: ResultSink,
    deadline: Instant,
    timeout: Duration,
}

impl PendingRequest {
    fn complete(self, id: u64, outcome: RequestOutcome) {
        match self.sink {
            // Receiver dropped means the caller gave up; nothing to do.
            ResultSink::Caller(tx) => {
                let _ = tx.send(outcome);
            }
            ResultSink::Detached => match outcome {
                Ok(_) => {}
                Err(e @ (MuxError::Disposed | MuxError::ConnectionLost)) => {
                    debug!("[mux-client] {} (id={id}) dropped: {e}", self.method);
                }
                Err(e) => warn!("[mux-client] {} (id={id}) failed: {e}", self.method),
            },
        }
    }
}

/// Table of in-flight requests.
pub struct RequestCorrelator {
    next_id: AtomicU64,
    pending: Mutex<AHashMap<u64, PendingRequest>>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(AHashMap::new()),
        }
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Reserve an id for a request whose caller awaits the returned receiver.
    pub fn register(&self, method: &str, timeout: Duration) -> (u64, oneshot::Receiver<RequestOutcome>) {
        let (tx, rx) = oneshot::channel();
        let id = self.insert(method, ResultSink::Caller(tx), timeout);
        (id, rx)
    }

    /// Reserve an id for a control request nobody awaits.
    pub fn register_detached(&self, method: &str, timeout: Duration) -> u64 {
        self.insert(method, ResultSink::Detached, timeout)
    }

    fn insert(&self, method: &str, sink: ResultSink, timeout: Duration) -> u64 {
        let id = self.allocate_id();
        let entry = PendingRequest {
            method: method.to_string(),
            sink,
            deadline: deadline_after(timeout),
            timeout,
        };
        self.pending.lock().insert(id, entry);
        id
    }

    /// Deliver a response. Returns `false` for unknown ids (late, duplicate,
    /// or never issued); those are discarded.
    pub fn resolve(&self, id: u64, outcome: Result<Value, RemoteError>) -> bool {
        let Some(entry) = self.pending.lock().remove(&id) else {
            debug!("[mux-client] discarding response for unknown id={id}");
            return false;
        };
        entry.complete(id, outcome.map_err(MuxError::Remote));
        true
    }

    /// Forget a request without delivering anything. Used by a caller whose
    /// own deadline already fired. Returns `false` if the entry was already
    /// resolved.
    pub fn abandon(&self, id: u64) -> bool {
        self.pending.lock().remove(&id).is_some()
    }

    /// Fail every request whose deadline has passed with [`MuxError::Timeout`].
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<(u64, PendingRequest)> = {
            let mut map = self.pending.lock();
            let ids: Vec<u64> = map
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| map.remove(&id).map(|entry| (id, entry)))
                .collect()
        };
        let count = expired.len();
        for (id, entry) in expired {
            let timeout = entry.timeout;
            entry.complete(id, Err(MuxError::Timeout(timeout)));
        }
        count
    }

    /// Fail every pending request with the error produced by `error`.
    pub fn fail_all(&self, error: impl Fn() -> MuxError) -> usize {
        let drained: Vec<(u64, PendingRequest)> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            entry.complete(id, Err(error()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

/// `now + timeout`, saturating to a distant deadline instead of overflowing.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Roughly thirty years.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn unbounded_timeout_never_expires() {
        let c = RequestCorrelator::new();
        let (_id, mut rx) = c.register("m", Duration::MAX);
        assert_eq!(c.sweep_expired(Instant::now() + Duration::from_secs(86_400)), 0);
        assert_eq!(c.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn ids_are_monotonic() {
        let c = RequestCorrelator::new();
        let (a, _ra) = c.register("m", TIMEOUT);
        let b = c.register_detached("m", TIMEOUT);
        let (d, _rd) = c.register("m", TIMEOUT);
        assert!(a < b && b < d);
        assert_eq!(c.len(), 3);
    }

    #[test]
    fn resolve_delivers_to_matching_caller() {
        let c = RequestCorrelator::new();
        let (a, mut ra) = c.register("a", TIMEOUT);
        let (b, mut rb) = c.register("b", TIMEOUT);

        assert!(c.resolve(b, Ok(json!("for-b"))));
        assert!(c.resolve(a, Ok(json!("for-a"))));

        assert_eq!(ra.try_recv().unwrap().unwrap(), json!("for-a"));
        assert_eq!(rb.try_recv().unwrap().unwrap(), json!("for-b"));
        assert!(c.is_empty());
    }

    #[test]
    fn remote_error_is_carried_to_caller() {
        let c = RequestCorrelator::new();
        let (id, mut rx) = c.register("private/buy", TIMEOUT);
        let err = RemoteError {
            code: 13009,
            message: "unauthorized".into(),
            data: None,
        };
        assert!(c.resolve(id, Err(err.clone())));
        assert_eq!(rx.try_recv().unwrap(), Err(MuxError::Remote(err)));
    }

    #[test]
    fn unknown_and_duplicate_ids_are_discarded() {
        let c = RequestCorrelator::new();
        assert!(!c.resolve(42, Ok(Value::Null)));

        let (id, _rx) = c.register("m", TIMEOUT);
        assert!(c.resolve(id, Ok(Value::Null)));
        assert!(!c.resolve(id, Ok(Value::Null)));
    }

    #[test]
    fn resolve_after_caller_dropped_is_harmless() {
        let c = RequestCorrelator::new();
        let (id, rx) = c.register("m", TIMEOUT);
        drop(rx);
        assert!(c.resolve(id, Ok(Value::Null)));
    }

    #[test]
    fn fail_all_reaches_every_caller() {
        let c = RequestCorrelator::new();
        let mut receivers: Vec<_> = (0..3).map(|_| c.register("m", TIMEOUT).1).collect();
        c.register_detached("public/subscribe", TIMEOUT);

        assert_eq!(c.fail_all(|| MuxError::ConnectionLost), 4);
        for rx in &mut receivers {
            assert_eq!(rx.try_recv().unwrap(), Err(MuxError::ConnectionLost));
        }
        assert!(c.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_only_touches_expired_entries() {
        let c = RequestCorrelator::new();
        let (_short, mut short_rx) = c.register("short", Duration::from_secs(1));
        let (_long, mut long_rx) = c.register("long", Duration::from_secs(10));
        c.register_detached("public/unsubscribe", Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(c.sweep_expired(Instant::now()), 2);

        assert_eq!(
            short_rx.try_recv().unwrap(),
            Err(MuxError::Timeout(Duration::from_secs(1)))
        );
        assert!(long_rx.try_recv().is_err());
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn abandon_reports_whether_entry_was_live() {
        let c = RequestCorrelator::new();
        let (id, _rx) = c.register("m", TIMEOUT);
        assert!(c.abandon(id));
        assert!(!c.abandon(id));
    }
}
