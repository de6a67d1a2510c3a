//! In-process subscription bus.
//!
//! Each [`Subscription`] owns a bounded channel and the search query that
//! decides which pushed events it receives. Matching happens on the push
//! path, so subscribers only ever see events they asked for.
//!
//! Delivery never blocks a push: when a subscriber's buffer is full the event
//! is dropped for that subscriber, counted and logged. Subscribers that must
//! not miss events (projection handlers) use deliveries only as a wake-up and
//! read the log itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::event::Event;
use crate::search::SearchQueryBuilder;
use crate::types::AggregateType;
use crate::utils::lock_recovery::MutexRecovery;

type SubscriptionId = u64;

#[derive(Default)]
struct Registry {
    next_id: SubscriptionId,
    by_aggregate_type: HashMap<AggregateType, Vec<SubscriptionId>>,
    subscribers: HashMap<SubscriptionId, Subscriber>,
}

struct Subscriber {
    query: SearchQueryBuilder,
    sender: mpsc::Sender<Arc<dyn Event>>,
    dropped: Arc<AtomicU64>,
}

impl Registry {
    fn remove(&mut self, id: SubscriptionId) {
        let Some(subscriber) = self.subscribers.remove(&id) else {
            return;
        };
        for aggregate_type in subscriber.query.aggregate_types() {
            if let Some(ids) = self.by_aggregate_type.get_mut(aggregate_type) {
                ids.retain(|candidate| *candidate != id);
                if ids.is_empty() {
                    self.by_aggregate_type.remove(aggregate_type);
                }
            }
        }
    }
}

/// Registry of live subscriptions, owned by one eventstore.
#[derive(Clone)]
pub struct SubscriptionBus {
    registry: Arc<Mutex<Registry>>,
    capacity: usize,
}

impl std::fmt::Debug for SubscriptionBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.len())
            .finish()
    }
}

impl SubscriptionBus {
    /// Creates an empty bus whose subscriptions buffer `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            capacity: capacity.max(1),
        }
    }

    /// Registers a subscription receiving events matched by `query`.
    pub fn subscribe(&self, query: SearchQueryBuilder) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let dropped = Arc::new(AtomicU64::new(0));

        let mut registry = self.registry.lock_recover();
        let id = registry.next_id;
        registry.next_id += 1;
        for aggregate_type in query.aggregate_types() {
            let ids = registry
                .by_aggregate_type
                .entry(aggregate_type.clone())
                .or_default();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        registry.subscribers.insert(
            id,
            Subscriber {
                query,
                sender,
                dropped: Arc::clone(&dropped),
            },
        );
        drop(registry);
        debug!(subscription_id = id, "[subscription.subscribe] registered");

        Subscription {
            id,
            receiver,
            registry: Arc::downgrade(&self.registry),
            dropped,
        }
    }

    /// Delivers committed events to every matching subscription.
    pub fn notify(&self, events: &[Arc<dyn Event>]) {
        let mut registry = self.registry.lock_recover();
        let mut closed = Vec::new();

        for event in events {
            let Some(ids) = registry.by_aggregate_type.get(&event.aggregate().aggregate_type) else {
                continue;
            };
            for id in ids {
                let Some(subscriber) = registry.subscribers.get(id) else {
                    continue;
                };
                if !subscriber.query.matches(event.as_ref(), 0) {
                    continue;
                }
                match subscriber.sender.try_send(Arc::clone(event)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        subscriber.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            subscription_id = id,
                            sequence = event.sequence(),
                            event_type = %event.event_type(),
                            "[subscription.notify] subscriber buffer full, event dropped"
                        );
                    }
                    Err(TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }

        for id in closed {
            registry.remove(id);
        }
    }

    /// Number of registered subscriptions.
    pub fn len(&self) -> usize {
        self.registry.lock_recover().subscribers.len()
    }

    /// Whether no subscription is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receiving end of a subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriptionId,
    receiver: mpsc::Receiver<Arc<dyn Event>>,
    registry: Weak<Mutex<Registry>>,
    dropped: Arc<AtomicU64>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("dropped", &self.dropped_count())
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Waits for the next event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Arc<dyn Event>> {
        self.receiver.recv().await
    }

    /// Returns a buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<dyn Event>> {
        self.receiver.try_recv().ok()
    }

    /// Number of events dropped because the buffer was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Removes the subscription from the bus.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock_recover().remove(self.id);
            debug!(subscription_id = self.id, "[subscription.unsubscribe] removed");
        }
    }
}
