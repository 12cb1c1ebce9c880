//! Push notifications for external observers
//!
//! Events are `(name, JSON payload)` pairs. Current names:
//! - `telemetry`: full telemetry snapshot after an applied update
//! - `router_status`: router status after any state change

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use serde_json::Value;
use std::ops::Deref;
use std::sync::{Arc, Weak};

/// Notification sink capability
pub trait EventSink: Send + Sync {
    /// Whether anyone is listening; producers skip building payloads otherwise
    fn has_subscribers(&self) -> bool;

    fn notify(&self, event: &str, payload: Value);
}

/// Sink with no subscribers
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn has_subscribers(&self) -> bool {
        false
    }

    fn notify(&self, _event: &str, _payload: Value) {}
}

/// A delivered notification
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: String,
    pub payload: Value,
}

/// Receiving end of a `ChannelSink` subscription.
///
/// Derefs to the underlying channel receiver. Dropping it unsubscribes.
pub struct Subscription {
    rx: Receiver<Event>,
    _alive: Arc<()>,
}

impl Deref for Subscription {
    type Target = Receiver<Event>;

    fn deref(&self) -> &Self::Target {
        &self.rx
    }
}

struct Subscriber {
    tx: Sender<Event>,
    alive: Weak<()>,
}

/// Fans events out to channel subscribers
#[derive(Default)]
pub struct ChannelSink {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl ChannelSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = unbounded();
        let alive = Arc::new(());
        self.subscribers.lock().push(Subscriber {
            tx,
            alive: Arc::downgrade(&alive),
        });
        Subscription { rx, _alive: alive }
    }
}

impl EventSink for ChannelSink {
    fn has_subscribers(&self) -> bool {
        let mut subs = self.subscribers.lock();
        // Subscriptions dropped since the last notify don't count
        subs.retain(|sub| sub.alive.strong_count() > 0);
        !subs.is_empty()
    }

    fn notify(&self, event: &str, payload: Value) {
        let mut subs = self.subscribers.lock();
        subs.retain(|sub| {
            sub.alive.strong_count() > 0
                && sub
                    .tx
                    .send(Event {
                        name: event.to_string(),
                        payload: payload.clone(),
                    })
                    .is_ok()
        });
    }
}
