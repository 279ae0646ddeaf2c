use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::debug;

use super::{EVENTS_TARGET, Event, EventKind};

/// Default per-subscriber buffer.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

/// Delivery counters of the bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Events handed to `publish`.
    pub published: u64,
    /// Per-subscriber deliveries that fit in a buffer.
    pub delivered: u64,
    /// Per-subscriber deliveries dropped on a full buffer.
    pub dropped: u64,
}

struct Subscriber {
    sender: SyncSender<Event>,
    dropped: u64,
}

/// In-memory fan-out of progress events.
///
/// Each subscriber owns a bounded buffer. Publishing never blocks: when a
/// subscriber's buffer is full the event is dropped for that subscriber only
/// and counted in [`BusStats::dropped`].
pub struct EventBus {
    capacity: usize,
    subscribers: Mutex<HashMap<String, Subscriber>>,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl EventBus {
    /// Builds a bus whose subscribers buffer up to `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(HashMap::new()),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Registers a subscriber under `id`, replacing any previous registration.
    pub fn subscribe(&self, id: impl Into<String>) -> Receiver<Event> {
        let (sender, receiver) = mpsc::sync_channel(self.capacity);
        let id = id.into();
        debug!(target: EVENTS_TARGET, subscriber = %id, "subscriber registered");
        self.lock().insert(
            id,
            Subscriber {
                sender,
                dropped: 0,
            },
        );
        receiver
    }

    /// Removes the subscriber registered under `id`, closing its channel.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let removed = self.lock().remove(id).is_some();
        if removed {
            debug!(target: EVENTS_TARGET, subscriber = %id, "subscriber removed");
        }
        removed
    }

    /// Number of registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Sends an event to every subscriber without blocking.
    pub fn publish(&self, kind: EventKind, data: Value) {
        let event = Event {
            kind,
            data,
            timestamp: OffsetDateTime::now_utc(),
        };
        self.published.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.lock();
        subscribers.retain(|id, subscriber| match subscriber.sender.try_send(event.clone()) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                subscriber.dropped += 1;
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(
                    target: EVENTS_TARGET,
                    subscriber = %id,
                    "subscriber receiver dropped; removing"
                );
                false
            }
        });
    }

    /// Publishes `data` with a `timestamp` field added when it is an object.
    pub fn publish_stamped(&self, kind: EventKind, mut data: Value) {
        if let Value::Object(map) = &mut data
            && let Ok(stamp) = OffsetDateTime::now_utc().format(&Rfc3339)
        {
            map.insert("timestamp".to_owned(), Value::String(stamp));
        }
        self.publish(kind, data);
    }

    /// Snapshot of the delivery counters.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Events dropped for the subscriber registered under `id`.
    #[must_use]
    pub fn dropped_for(&self, id: &str) -> Option<u64> {
        self.lock().get(id).map(|subscriber| subscriber.dropped)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[test]
    fn delivers_to_every_subscriber() {
        let bus = EventBus::new(4);
        let first = bus.subscribe("ui");
        let second = bus.subscribe("audit");

        bus.publish(EventKind::ProbeStart, json!({ "nodes": 3 }));

        for receiver in [&first, &second] {
            let event = receiver.try_recv().expect("event delivered");
            assert_eq!(event.kind, EventKind::ProbeStart);
            assert_eq!(event.data["nodes"], 3);
        }
        assert_eq!(bus.stats().delivered, 2);
    }

    #[rstest]
    #[case(2)]
    #[case(5)]
    fn full_subscriber_does_not_block_others(#[case] others: usize) {
        let bus = Arc::new(EventBus::new(1));
        let _stalled = bus.subscribe("stalled");
        let receivers: Vec<_> = (0..others)
            .map(|index| bus.subscribe(format!("reader-{index}")))
            .collect();

        bus.publish(EventKind::VerifyStart, json!({}));
        for receiver in &receivers {
            receiver.try_recv().expect("first event");
        }

        let started = Instant::now();
        bus.publish(EventKind::VerifyComplete, json!({}));
        assert!(started.elapsed() < Duration::from_secs(1), "publish blocked");

        for receiver in &receivers {
            let event = receiver.try_recv().expect("second event");
            assert_eq!(event.kind, EventKind::VerifyComplete);
        }
        assert_eq!(bus.dropped_for("stalled"), Some(1));
        assert_eq!(bus.stats().dropped, 1);
    }

    #[test]
    fn unsubscribe_closes_the_channel() {
        let bus = EventBus::default();
        let receiver = bus.subscribe("ui");

        assert!(bus.unsubscribe("ui"));
        assert!(!bus.unsubscribe("ui"));
        assert!(receiver.recv().is_err(), "channel should be closed");
    }

    #[test]
    fn dropped_receivers_are_pruned_on_publish() {
        let bus = EventBus::default();
        drop(bus.subscribe("gone"));
        bus.publish(EventKind::ProbeStop, Value::Null);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn stamped_publish_adds_timestamp_to_objects_only() {
        let bus = EventBus::default();
        let receiver = bus.subscribe("ui");

        bus.publish_stamped(EventKind::NodePromoted, json!({ "tag": "hk" }));
        bus.publish_stamped(EventKind::NodePromoted, json!(["not", "a", "map"]));

        let object = receiver.try_recv().expect("object event");
        assert!(object.data["timestamp"].is_string());
        let array = receiver.try_recv().expect("array event");
        assert!(array.data.is_array());
    }

    #[test]
    fn concurrent_publishers_never_block() {
        let bus = Arc::new(EventBus::new(2));
        let _idle = bus.subscribe("idle");
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let bus = Arc::clone(&bus);
                thread::spawn(move || {
                    for _ in 0..50 {
                        bus.publish(EventKind::VerifyProgress, Value::Null);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("publisher thread");
        }
        let stats = bus.stats();
        assert_eq!(stats.published, 200);
        assert_eq!(stats.delivered + stats.dropped, 200);
        assert_eq!(stats.delivered, 2);
    }
}
