use crate::Event;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Default internal queue depth.
pub const DEFAULT_BUS_CAPACITY: usize = 512;

/// A subscriber callback. Handlers run on the dispatcher task and must
/// not block for long.
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Bounded, non-blocking publish/subscribe bus.
///
/// Subscribers are keyed by name; registering a duplicate name gets a
/// numeric suffix appended. A single dispatcher task drains the queue
/// and invokes every subscriber in registration order. When the queue is
/// full, [`publish`](Bus::publish) drops the event and counts the drop.
pub struct Bus {
    tx: mpsc::Sender<Event>,
    subs: Arc<Mutex<Vec<(String, Handler)>>>,
    next_id: AtomicU64,
    dropped: Arc<AtomicU64>,
    closed: CancellationToken,
}

impl Bus {
    /// Creates a bus and spawns its dispatcher. `capacity == 0` selects
    /// [`DEFAULT_BUS_CAPACITY`].
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_BUS_CAPACITY
        } else {
            capacity
        };
        let (tx, rx) = mpsc::channel(capacity);
        let subs: Arc<Mutex<Vec<(String, Handler)>>> = Arc::new(Mutex::new(Vec::new()));
        let closed = CancellationToken::new();

        tokio::spawn(dispatch(rx, Arc::clone(&subs), closed.clone()));

        Self {
            tx,
            subs,
            next_id: AtomicU64::new(0),
            dropped: Arc::new(AtomicU64::new(0)),
            closed,
        }
    }

    /// Registers `handler` under `name` and returns the key actually
    /// used (the name, possibly suffixed to make it unique).
    pub fn subscribe(&self, name: &str, handler: Handler) -> String {
        let mut subs = self.subs.lock();
        let key = if subs.iter().any(|(k, _)| k == name) {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            format!("{name}_{id}")
        } else {
            name.to_string()
        };
        subs.push((key.clone(), handler));
        key
    }

    /// Removes the subscriber registered under `key`. Unknown keys are
    /// ignored, so unsubscribing twice is harmless.
    pub fn unsubscribe(&self, key: &str) {
        self.subs.lock().retain(|(k, _)| k != key);
    }

    /// Enqueues an event for dispatch. Never blocks: if the queue is
    /// full the event is dropped and counted.
    pub fn publish(&self, event: Event) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of events dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stops the dispatcher. Safe to call more than once.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

async fn dispatch(
    mut rx: mpsc::Receiver<Event>,
    subs: Arc<Mutex<Vec<(String, Handler)>>>,
    closed: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = closed.cancelled() => return,
            event = rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        // Snapshot the handlers so none run under the lock.
        let handlers: Vec<Handler> = subs.lock().iter().map(|(_, h)| Arc::clone(h)).collect();
        trace!(kind = ?event.kind, subscribers = handlers.len(), "dispatching event");
        for handler in handlers {
            handler(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventKind;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting_handler(counter: Arc<AtomicUsize>) -> Handler {
        Arc::new(move |_e: &Event| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn publishes_reach_subscriber_until_unsubscribed() {
        let bus = Bus::new(16);
        let count = Arc::new(AtomicUsize::new(0));
        let key = bus.subscribe("test", counting_handler(Arc::clone(&count)));

        for _ in 0..3 {
            bus.publish(Event::new(EventKind::DeviceConnected, "abc", 1));
        }
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        bus.unsubscribe(&key);
        bus.unsubscribe(&key); // idempotent
        bus.publish(Event::new(EventKind::DeviceConnected, "abc", 2));
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn duplicate_names_get_distinct_keys() {
        let bus = Bus::new(16);
        let count = Arc::new(AtomicUsize::new(0));
        let k1 = bus.subscribe("dup", counting_handler(Arc::clone(&count)));
        let k2 = bus.subscribe("dup", counting_handler(Arc::clone(&count)));
        assert_ne!(k1, k2);

        bus.publish(Event::new(EventKind::DeviceDisconnected, "abc", 1));
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn close_is_safe_to_call_twice() {
        let bus = Bus::new(4);
        bus.close();
        bus.close();
        // Publishing after close must not panic; the event just queues
        // (or drops) with nobody draining.
        bus.publish(Event::new(EventKind::DeviceConnected, "abc", 1));
    }

    #[tokio::test]
    async fn full_queue_drops_and_counts() {
        let bus = Bus::new(1);
        bus.close(); // stop the dispatcher so the queue stays full
        settle().await;
        bus.publish(Event::new(EventKind::DeviceConnected, "a", 1));
        for _ in 0..5 {
            bus.publish(Event::new(EventKind::DeviceConnected, "a", 1));
        }
        assert!(bus.dropped() >= 4);
    }
}
