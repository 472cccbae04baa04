//! Ref-counted channel subscriptions.
//!
//! Each channel name maps to an ordered list of handlers. The list length is
//! the channel's reference count: the entry is created with the first handler
//! and removed with the last, and those two moments are the only ones at
//! which the remote side needs to hear about the channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;
use mux_core::Push;
use parking_lot::Mutex;

use crate::invoker::HandlerInvoker;

/// Callback invoked for each push on a subscribed channel.
pub type PushHandler = Arc<dyn Fn(&Push) + Send + Sync>;

/// Identifies one handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Result of removing a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// No such channel or handler.
    NotFound,
    /// Handler removed; this many remain on the channel.
    Remaining(usize),
    /// That was the last handler; the channel entry is gone.
    Last,
}

struct ChannelSubscription {
    /// Insertion order is delivery order.
    handlers: Vec<(HandlerId, PushHandler)>,
}

/// Map of channel name to handlers.
pub struct SubscriptionRegistry {
    next_handler: AtomicU64,
    channels: Mutex<AHashMap<String, ChannelSubscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            next_handler: AtomicU64::new(1),
            channels: Mutex::new(AHashMap::new()),
        }
    }

    /// Register `handler` on `channel`. The flag is `true` when this created
    /// the channel entry, i.e. the channel needs activating.
    pub fn add(&self, channel: &str, handler: PushHandler) -> (HandlerId, bool) {
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        let mut channels = self.channels.lock();
        let first = !channels.contains_key(channel);
        channels
            .entry(channel.to_string())
            .or_insert_with(|| ChannelSubscription {
                handlers: Vec::new(),
            })
            .handlers
            .push((id, handler));
        (id, first)
    }

    /// Remove one handler registration.
    pub fn remove(&self, channel: &str, id: HandlerId) -> Removal {
        let mut channels = self.channels.lock();
        let Some(sub) = channels.get_mut(channel) else {
            return Removal::NotFound;
        };
        let Some(idx) = sub.handlers.iter().position(|(h, _)| *h == id) else {
            return Removal::NotFound;
        };
        sub.handlers.remove(idx);
        if sub.handlers.is_empty() {
            channels.remove(channel);
            Removal::Last
        } else {
            Removal::Remaining(sub.handlers.len())
        }
    }

    /// Deliver `push` to every handler of its channel, in registration order.
    /// Returns the number of handlers invoked.
    pub fn fan_out(&self, push: &Push, invoker: &dyn HandlerInvoker) -> usize {
        // Snapshot so handlers may (un)subscribe without deadlocking.
        let handlers: Vec<PushHandler> = match self.channels.lock().get(&push.channel) {
            Some(sub) => sub.handlers.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return 0,
        };
        for handler in &handlers {
            invoker.invoke(handler, push);
        }
        handlers.len()
    }

    /// Handler count for `channel` (0 when absent).
    pub fn ref_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map_or(0, |sub| sub.handlers.len())
    }

    /// All subscribed channel names, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop every subscription, returning the channel names that were active.
    pub fn clear(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.lock().drain().map(|(name, _)| name).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
