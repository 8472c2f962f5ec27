use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::warn;

const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// A typed event as delivered to hub subscribers: an event name plus the
/// JSON-encoded payload.
#[derive(Debug, Clone, Serialize)]
pub struct HubMessage {
    /// Event name, e.g. `packet:new` or `device:connected`.
    pub event: String,
    /// The entity payload.
    pub data: serde_json::Value,
}

struct HubSubscriber {
    id: u64,
    tx: mpsc::Sender<HubMessage>,
    alive: bool,
}

/// One consumer's view of the event stream.
pub struct Subscription {
    /// Identifier for [`Hub::unsubscribe`].
    pub id: u64,
    rx: mpsc::Receiver<HubMessage>,
}

impl Subscription {
    /// Receives the next event; `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<HubMessage> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<HubMessage> {
        self.rx.try_recv().ok()
    }
}

/// Fan-out of typed events to external consumers (browser transports,
/// tests).
///
/// Each subscriber gets its own bounded queue; a slow consumer loses
/// messages rather than slowing the broadcaster. Events broadcast from a
/// single task arrive in order; across tasks only per-producer order
/// holds.
#[derive(Default)]
pub struct Hub {
    subscribers: Mutex<Vec<HubSubscriber>>,
    next_id: AtomicU64,
}

impl Hub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push(HubSubscriber {
            id,
            tx,
            alive: true,
        });
        Subscription { id, rx }
    }

    /// Removes a subscriber. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|s| s.id != id);
    }

    /// Number of connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Sends `data` to every subscriber under the event name. Never
    /// blocks: full queues drop the message, dropped receivers are
    /// pruned.
    pub fn broadcast<T: Serialize>(&self, event: &str, data: &T) {
        let payload = match serde_json::to_value(data) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(event, error = %e, "failed to encode hub payload");
                return;
            }
        };
        let msg = HubMessage {
            event: event.to_string(),
            data: payload,
        };

        let mut subs = self.subscribers.lock();
        for sub in subs.iter_mut() {
            match sub.tx.try_send(msg.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {} // drop, consumer is behind
                Err(mpsc::error::TrySendError::Closed(_)) => sub.alive = false,
            }
        }
        subs.retain(|s| s.alive);
    }
}
