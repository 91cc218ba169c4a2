//! Delivery dispatch — publishes locally delivered envelopes to subscribers.
//!
//! An envelope of type `a.b` is published under `delivery.a.b`, then
//! `delivery.a`, then `delivery`, most specific first.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::envelope::Envelope;

/// Root key every delivery is published under.
pub const DELIVERY: &str = "delivery";

/// A subscriber callback.
pub type DeliveryHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Handle returned by [`DeliveryDispatcher::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Explicit dispatch table from key to subscribers.
pub struct DeliveryDispatcher {
    handlers: HashMap<String, Vec<(SubscriptionId, DeliveryHandler)>>,
    next_id: u64,
}

impl DeliveryDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            next_id: 0,
        }
    }

    /// Subscribe to a dispatch key such as `delivery.mmrp.handshake`.
    pub fn subscribe(&mut self, key: impl Into<String>, handler: DeliveryHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.handlers.entry(key.into()).or_default().push((id, handler));
        id
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let mut removed = false;
        self.handlers.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|(sub_id, _)| *sub_id != id);
            removed |= subs.len() != before;
            !subs.is_empty()
        });
        removed
    }

    #[cfg(test)]
    pub(crate) fn subscription_count(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    /// Handlers to run for an envelope, in publication order.
    ///
    /// Returned as a snapshot so callers can invoke them without holding the
    /// lock around the dispatcher.
    pub fn handlers_for(&self, message_type: &str) -> Vec<DeliveryHandler> {
        let mut out = Vec::new();
        for key in dispatch_keys(message_type) {
            if let Some(subs) = self.handlers.get(&key) {
                trace!("Dispatching {message_type} to {} handler(s) at {key}", subs.len());
                out.extend(subs.iter().map(|(_, handler)| Arc::clone(handler)));
            }
        }
        out
    }
}

impl Default for DeliveryDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatch keys for a message type, most specific first.
pub fn dispatch_keys(message_type: &str) -> Vec<String> {
    let segments: Vec<&str> = message_type.split('.').filter(|s| !s.is_empty()).collect();
    (0..=segments.len())
        .rev()
        .map(|n| {
            if n == 0 {
                DELIVERY.to_string()
            } else {
                format!("{DELIVERY}.{}", segments[..n].join("."))
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
