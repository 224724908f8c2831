//! Per-consumer FIFO event queues
//!
//! `deliver` only enqueues; `dispatch` drains. Each consumer's events
//! run strictly in enqueue order, one at a time, and a panicking
//! callback is caught and logged; the event is dropped and dispatch
//! continues with the next one. Removing a listener (or a whole
//! consumer) purges its queued-but-undispatched deliveries before
//! returning, so no callback runs after removal returns.

use hearth_graph::ChangeRecord;
use hearth_types::{ConsumerId, DemandId, ListenerHandle, Location, StopReason};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from event delivery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The target consumer is not (or no longer) registered; the
    /// caller holding the registration should unregister it.
    #[error("no such consumer: {0}")]
    NoSuchConsumer(ConsumerId),

    /// The listener registration is stale.
    #[error("no such listener: {0}")]
    NoSuchListener(ListenerHandle),
}

/// Structural payload of a pattern match callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternEvent {
    pub demand: DemandId,
    /// Root location the pattern completed (or ceased to be complete) at.
    pub root: Location,
    /// Resolved slot locations by slot name, at match time.
    pub slots: Vec<(String, Location)>,
}

/// An event on a consumer's queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    /// A raw graph change matched one of the consumer's listeners.
    Resource(ChangeRecord),
    /// A pattern demand entered `Complete` at a candidate root.
    PatternAvailable(PatternEvent),
    /// A previously-complete match was lost.
    PatternUnavailable(PatternEvent),
    /// The consumer's exclusive access grant was preempted.
    AccessRevoked { location: Location },
    /// Consumer lifecycle start.
    Started,
    /// Consumer lifecycle stop with reason.
    Stopped(StopReason),
}

type EventListener = Box<dyn FnMut(&Event) + Send>;

struct Registration {
    consumer: ConsumerId,
    /// Cleared on removal; re-checked right before every invocation so
    /// a listener removed mid-dispatch (even by its own callback) sees
    /// no further events.
    alive: Arc<AtomicBool>,
    /// Shared so dispatch can invoke without holding the broker lock.
    callback: Arc<Mutex<EventListener>>,
}

struct QueueEntry {
    listener: ListenerHandle,
    event: Event,
}

#[derive(Default)]
struct Inner {
    queues: HashMap<ConsumerId, VecDeque<QueueEntry>>,
    listeners: HashMap<ListenerHandle, Registration>,
}

/// Serialized, isolated event delivery per consumer.
#[derive(Default)]
pub struct EventBroker {
    inner: Mutex<Inner>,
}

impl EventBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer, creating its (empty) queue. Idempotent.
    pub fn register_consumer(&self, consumer: ConsumerId) {
        self.inner.lock().queues.entry(consumer).or_default();
    }

    /// Whether the consumer is registered.
    pub fn has_consumer(&self, consumer: ConsumerId) -> bool {
        self.inner.lock().queues.contains_key(&consumer)
    }

    /// Remove a consumer: its queue is dropped (pending events
    /// included) and all its listener registrations are withdrawn.
    /// No callback for this consumer runs after this returns.
    pub fn remove_consumer(&self, consumer: ConsumerId) -> bool {
        let mut inner = self.inner.lock();
        let existed = inner.queues.remove(&consumer).is_some();
        inner.listeners.retain(|_, reg| {
            if reg.consumer == consumer {
                reg.alive.store(false, Ordering::SeqCst);
                false
            } else {
                true
            }
        });
        if existed {
            debug!(%consumer, "consumer removed from broker");
        }
        existed
    }

    /// Register a listener for a consumer.
    pub fn add_listener(
        &self,
        consumer: ConsumerId,
        listener: impl FnMut(&Event) + Send + 'static,
    ) -> Result<ListenerHandle, BrokerError> {
        let mut inner = self.inner.lock();
        if !inner.queues.contains_key(&consumer) {
            return Err(BrokerError::NoSuchConsumer(consumer));
        }
        let handle = ListenerHandle::new();
        inner.listeners.insert(
            handle.clone(),
            Registration {
                consumer,
                alive: Arc::new(AtomicBool::new(true)),
                callback: Arc::new(Mutex::new(Box::new(listener))),
            },
        );
        Ok(handle)
    }

    /// Remove a listener registration and purge its undispatched
    /// deliveries. Returns whether the registration existed.
    pub fn remove_listener(&self, handle: &ListenerHandle) -> bool {
        let mut inner = self.inner.lock();
        let Some(reg) = inner.listeners.remove(handle) else {
            return false;
        };
        reg.alive.store(false, Ordering::SeqCst);
        if let Some(queue) = inner.queues.get_mut(&reg.consumer) {
            queue.retain(|entry| entry.listener != *handle);
        }
        true
    }

    /// The consumer a listener belongs to.
    pub fn listener_consumer(&self, handle: &ListenerHandle) -> Option<ConsumerId> {
        self.inner.lock().listeners.get(handle).map(|r| r.consumer)
    }

    /// Enqueue an event for a consumer's listener. Never blocks on
    /// listener execution.
    pub fn deliver(
        &self,
        consumer: ConsumerId,
        listener: &ListenerHandle,
        event: Event,
    ) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock();
        if !inner.listeners.contains_key(listener) {
            return Err(BrokerError::NoSuchListener(listener.clone()));
        }
        let Some(queue) = inner.queues.get_mut(&consumer) else {
            return Err(BrokerError::NoSuchConsumer(consumer));
        };
        queue.push_back(QueueEntry {
            listener: listener.clone(),
            event,
        });
        Ok(())
    }

    /// Number of undispatched events for a consumer.
    pub fn pending(&self, consumer: ConsumerId) -> usize {
        self.inner
            .lock()
            .queues
            .get(&consumer)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Drain one consumer's queue, invoking callbacks in enqueue
    /// order. Returns the number of callbacks invoked.
    pub fn dispatch(&self, consumer: ConsumerId) -> usize {
        let mut invoked = 0;
        loop {
            // Pop one entry and clone its callback handle, so the
            // broker lock is not held across consumer code (which may
            // re-enter the broker).
            let (handle, event, alive, callback) = {
                let mut inner = self.inner.lock();
                let Some(queue) = inner.queues.get_mut(&consumer) else {
                    break;
                };
                let Some(entry) = queue.pop_front() else {
                    break;
                };
                let Some(reg) = inner.listeners.get(&entry.listener) else {
                    // Listener vanished between enqueue and dispatch.
                    continue;
                };
                (
                    entry.listener,
                    entry.event,
                    reg.alive.clone(),
                    reg.callback.clone(),
                )
            };
            if !alive.load(Ordering::SeqCst) {
                continue;
            }
            invoked += 1;
            let mut cb = callback.lock();
            if catch_unwind(AssertUnwindSafe(|| (*cb)(&event))).is_err() {
                warn!(%consumer, listener = %handle, "consumer callback panicked; event dropped");
            }
        }
        invoked
    }

    /// Drain every consumer queue until all are empty (callbacks may
    /// enqueue further events). Returns total callbacks invoked.
    pub fn dispatch_all(&self) -> usize {
        let mut total = 0;
        loop {
            let consumers: Vec<ConsumerId> = {
                let inner = self.inner.lock();
                let mut ids: Vec<ConsumerId> = inner
                    .queues
                    .iter()
                    .filter(|(_, q)| !q.is_empty())
                    .map(|(id, _)| *id)
                    .collect();
                ids.sort_unstable();
                ids
            };
            if consumers.is_empty() {
                break;
            }
            for consumer in consumers {
                total += self.dispatch(consumer);
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn record(seq: u64) -> ChangeRecord {
        ChangeRecord {
            seq,
            location: Location(1),
            parent: None,
            path: hearth_types::ResourcePath::parse("a").unwrap(),
            kind: hearth_graph::ChangeKind::ValueChanged,
            timestamp: hearth_types::Timestamp(0),
        }
    }

    #[test]
    fn test_deliver_then_dispatch_in_order() {
        let broker = EventBroker::new();
        let consumer = ConsumerId::new();
        broker.register_consumer(consumer);

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        let handle = broker
            .add_listener(consumer, move |event| {
                if let Event::Resource(r) = event {
                    seen2.lock().unwrap().push(r.seq);
                }
            })
            .unwrap();

        for seq in 0..5 {
            broker
                .deliver(consumer, &handle, Event::Resource(record(seq)))
                .unwrap();
        }
        assert_eq!(broker.pending(consumer), 5);
        assert_eq!(broker.dispatch(consumer), 5);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(broker.pending(consumer), 0);
    }

    #[test]
    fn test_deliver_to_unknown_consumer_fails() {
        let broker = EventBroker::new();
        let consumer = ConsumerId::new();
        broker.register_consumer(consumer);
        let handle = broker.add_listener(consumer, |_| {}).unwrap();
        broker.remove_consumer(consumer);

        assert!(matches!(
            broker.deliver(consumer, &handle, Event::Started),
            Err(BrokerError::NoSuchListener(_) | BrokerError::NoSuchConsumer(_))
        ));
    }

    #[test]
    fn test_panicking_callback_is_isolated() {
        let broker = EventBroker::new();
        let consumer = ConsumerId::new();
        broker.register_consumer(consumer);

        let count = Arc::new(StdMutex::new(0usize));
        let count2 = count.clone();
        let handle = broker
            .add_listener(consumer, move |_| {
                let n = {
                    let mut n = count2.lock().unwrap();
                    *n += 1;
                    *n
                };
                if n == 1 {
                    panic!("first event fails");
                }
            })
            .unwrap();

        broker.deliver(consumer, &handle, Event::Started).unwrap();
        broker.deliver(consumer, &handle, Event::Started).unwrap();
        assert_eq!(broker.dispatch(consumer), 2);
        assert_eq!(*count.lock().unwrap(), 2);
    }

    #[test]
    fn test_remove_listener_purges_pending() {
        let broker = EventBroker::new();
        let consumer = ConsumerId::new();
        broker.register_consumer(consumer);

        let seen = Arc::new(StdMutex::new(0usize));
        let seen2 = seen.clone();
        let handle = broker
            .add_listener(consumer, move |_| {
                *seen2.lock().unwrap() += 1;
            })
            .unwrap();

        broker.deliver(consumer, &handle, Event::Started).unwrap();
        broker.deliver(consumer, &handle, Event::Started).unwrap();
        assert!(broker.remove_listener(&handle));
        assert_eq!(broker.pending(consumer), 0);
        broker.dispatch(consumer);
        assert_eq!(*seen.lock().unwrap(), 0);
    }

    #[test]
    fn test_listener_removing_itself_mid_dispatch() {
        let broker = Arc::new(EventBroker::new());
        let consumer = ConsumerId::new();
        broker.register_consumer(consumer);

        let seen = Arc::new(StdMutex::new(0usize));
        let seen2 = seen.clone();
        let broker2 = broker.clone();
        let slot: Arc<StdMutex<Option<ListenerHandle>>> = Arc::new(StdMutex::new(None));
        let slot2 = slot.clone();
        let handle = broker
            .add_listener(consumer, move |_| {
                *seen2.lock().unwrap() += 1;
                if let Some(h) = slot2.lock().unwrap().as_ref() {
                    broker2.remove_listener(h);
                }
            })
            .unwrap();
        *slot.lock().unwrap() = Some(handle.clone());

        broker.deliver(consumer, &handle, Event::Started).unwrap();
        broker.deliver(consumer, &handle, Event::Started).unwrap();
        broker.dispatch(consumer);
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn test_events_serialize() {
        let event = Event::AccessRevoked {
            location: Location(9),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_consumers_are_isolated() {
        let broker = EventBroker::new();
        let slow = ConsumerId::new();
        let fast = ConsumerId::new();
        broker.register_consumer(slow);
        broker.register_consumer(fast);

        let slow_handle = broker
            .add_listener(slow, |_| panic!("always fails"))
            .unwrap();
        let fast_seen = Arc::new(StdMutex::new(0usize));
        let fast_seen2 = fast_seen.clone();
        let fast_handle = broker
            .add_listener(fast, move |_| {
                *fast_seen2.lock().unwrap() += 1;
            })
            .unwrap();

        broker.deliver(slow, &slow_handle, Event::Started).unwrap();
        broker.deliver(fast, &fast_handle, Event::Started).unwrap();
        broker.dispatch_all();
        assert_eq!(*fast_seen.lock().unwrap(), 1);
    }
}
