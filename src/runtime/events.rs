// Event bus routing multi-chunk streams (chat responses, process
// output) from producers to the subscriber registered for a
// correlation id. One explicit instance is owned by the daemon and
// injected into producers; there is no process-wide global state.

use crate::runtime::protocol::{CorrelationId, StreamPayload, StreamResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Callback set invoked for events on one correlation id
pub struct StreamCallbacks {
    pub on_chunk: Box<dyn Fn(StreamPayload) + Send + Sync>,
    pub on_end: Box<dyn Fn(StreamResult) + Send + Sync>,
    pub on_error: Box<dyn Fn(String) + Send + Sync>,
}

/// Token identifying one subscription for cancellation
///
/// Tokens are never reused; unsubscribing with a token that was already
/// replaced or removed is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionToken {
    id: u64,
    key: CorrelationId,
}

impl SubscriptionToken {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> CorrelationId {
        self.key
    }
}

struct Subscription {
    token: u64,
    callbacks: Arc<StreamCallbacks>,
}

/// Routes published events to at most one subscriber per correlation id
///
/// Terminal events (`publish_end`, `publish_error`) remove the
/// subscription before invoking its callback, so the terminal callback
/// fires exactly once and later chunks are dropped. Publishing without
/// a subscriber is a silent no-op; producers never block on consumers.
pub struct EventBus {
    subscriptions: Mutex<HashMap<CorrelationId, Subscription>>,
    next_token: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Register callbacks for a correlation id
    ///
    /// An existing subscription under the same id is replaced and never
    /// receives further events.
    pub fn subscribe(&self, key: CorrelationId, callbacks: StreamCallbacks) -> SubscriptionToken {
        let id = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut subscriptions = self.subscriptions.lock().unwrap();
        subscriptions.insert(
            key,
            Subscription {
                token: id,
                callbacks: Arc::new(callbacks),
            },
        );
        SubscriptionToken { id, key }
    }

    /// Remove a subscription by token
    ///
    /// No-op when the token's subscription was already replaced or
    /// removed by a terminal event.
    pub fn unsubscribe(&self, token: SubscriptionToken) {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        if subscriptions
            .get(&token.key)
            .map(|s| s.token == token.id)
            .unwrap_or(false)
        {
            subscriptions.remove(&token.key);
        }
    }

    /// Deliver a non-terminal chunk to the subscriber, if any
    pub fn publish_chunk(&self, key: CorrelationId, payload: StreamPayload) {
        // Clone the callback set out of the lock; callbacks may re-enter
        // the bus (e.g. unsubscribe from within on_chunk)
        let callbacks = {
            let subscriptions = self.subscriptions.lock().unwrap();
            subscriptions.get(&key).map(|s| Arc::clone(&s.callbacks))
        };
        if let Some(callbacks) = callbacks {
            (callbacks.on_chunk)(payload);
        }
    }

    /// Deliver the terminal end event and remove the subscription
    pub fn publish_end(&self, key: CorrelationId, result: StreamResult) {
        let removed = {
            let mut subscriptions = self.subscriptions.lock().unwrap();
            subscriptions.remove(&key)
        };
        if let Some(subscription) = removed {
            (subscription.callbacks.on_end)(result);
        }
    }

    /// Deliver the terminal error event and remove the subscription
    pub fn publish_error(&self, key: CorrelationId, message: String) {
        let removed = {
            let mut subscriptions = self.subscriptions.lock().unwrap();
            subscriptions.remove(&key)
        };
        if let Some(subscription) = removed {
            (subscription.callbacks.on_error)(message);
        }
    }

    /// Number of active subscriptions
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
