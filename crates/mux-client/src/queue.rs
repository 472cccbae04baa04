//! Outbound queue for requests issued while the connection is not writable.
//!
//! Only request envelopes are queued. Channel activation is never queued: the
//! lifecycle manager sends one batched activation for the whole registry when
//! a connection opens, which also covers channels subscribed while offline.

use std::collections::VecDeque;

/// A serialized request awaiting a writable connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Correlation id of the request this envelope carries.
    pub id: u64,
    pub text: String,
}

/// FIFO of [`OutboundMessage`]s.
///
/// # Thread safety
///
/// Not thread-safe. Owned by the lifecycle manager's connection slot and only
/// touched under its lock.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    messages: VecDeque<OutboundMessage>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: u64, text: String) {
        self.messages.push_back(OutboundMessage { id, text });
    }

    /// Remove everything, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = OutboundMessage> + '_ {
        self.messages.drain(..)
    }

    /// Drop the envelope for `id`, if still queued. Used when its request
    /// times out before the connection opens.
    pub fn remove(&mut self, id: u64) -> bool {
        match self.messages.iter().position(|m| m.id == id) {
            Some(idx) => {
                self.messages.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Discard all queued envelopes, returning how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.messages.len();
        self.messages.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
