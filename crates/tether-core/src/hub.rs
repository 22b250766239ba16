//! In-process fact hub.
//!
//! A [`Hub`] stores at most one present value per [`FactKey`] and broadcasts
//! every change to its subscribers. New subscribers get a replay of every
//! stored fact first.
//!
//! # Delivery
//!
//! Nothing is delivered synchronously inside [`Hub::set`]. Each subscriber
//! owns an unbounded channel; `set` enqueues a stamped delivery and the
//! subscriber re-validates it when it reaches [`Subscription::recv`]:
//!
//! - the subscriber must still be registered;
//! - the key must still hold the value the delivery was stamped with
//!   (a newer write supersedes older queued deliveries for the same key).
//!
//! So a slow subscriber may skip intermediate values but always ends on the
//! latest state of each key.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::ids::{FactKey, SubscriberId};
use crate::value::FactValue;

/// One observed change: `value` is `None` when the fact was retracted.
#[derive(Clone, Debug)]
pub struct FactEvent {
    /// Key that changed.
    pub key: FactKey,
    /// New value, or `None` for a retraction.
    pub value: Option<FactValue>,
}

#[derive(Debug)]
struct Delivery {
    key: FactKey,
    value: Option<FactValue>,
    stamp: Option<u64>,
}

#[derive(Debug)]
struct StoredFact {
    value: FactValue,
    stamp: u64,
}

#[derive(Default)]
struct HubState {
    facts: HashMap<FactKey, StoredFact>,
    subscribers: HashMap<SubscriberId, mpsc::UnboundedSender<Delivery>>,
    next_stamp: u64,
}

impl HubState {
    fn broadcast(&self, key: FactKey, value: Option<&FactValue>, stamp: Option<u64>) {
        for tx in self.subscribers.values() {
            // A closed receiver belongs to a subscription being dropped.
            let _ = tx.send(Delivery {
                key,
                value: value.cloned(),
                stamp,
            });
        }
    }

    fn is_current(&self, id: SubscriberId, delivery: &Delivery) -> bool {
        if !self.subscribers.contains_key(&id) {
            return false;
        }
        match (self.facts.get(&delivery.key), delivery.stamp) {
            (Some(stored), Some(stamp)) => stored.stamp == stamp,
            (None, None) => true,
            _ => false,
        }
    }
}

/// Keyed publish/subscribe store. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct Hub {
    state: Arc<Mutex<HubState>>,
}

impl Hub {
    /// New empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish or retract a fact.
    ///
    /// A falsy or missing value retracts the key. Re-publishing the value
    /// already stored (same allocation) is a no-op. Returns whether the key
    /// now holds a value.
    pub fn set(&self, key: FactKey, value: impl Into<Option<FactValue>>) -> bool {
        let value = value.into().filter(FactValue::is_truthy);
        let mut state = self.state.lock();
        match value {
            Some(value) => {
                if state.facts.get(&key).is_some_and(|s| s.value.same(&value)) {
                    return true;
                }
                state.next_stamp += 1;
                let stamp = state.next_stamp;
                state.broadcast(key, Some(&value), Some(stamp));
                let _ = state.facts.insert(key, StoredFact { value, stamp });
                true
            }
            None => {
                if state.facts.remove(&key).is_some() {
                    state.broadcast(key, None, None);
                }
                false
            }
        }
    }

    /// Current value of a key.
    #[must_use]
    pub fn get(&self, key: FactKey) -> Option<FactValue> {
        self.state.lock().facts.get(&key).map(|s| s.value.clone())
    }

    /// Register a new subscriber. Every stored fact is queued for it first.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SubscriberId::new();
        let mut state = self.state.lock();
        for (key, stored) in &state.facts {
            let _ = tx.send(Delivery {
                key: *key,
                value: Some(stored.value.clone()),
                stamp: Some(stored.stamp),
            });
        }
        let _ = state.subscribers.insert(id, tx);
        drop(state);
        Subscription {
            id,
            hub: self.clone(),
            rx,
        }
    }

    /// Deregister a subscriber. Deliveries still queued for it are suppressed.
    pub fn off(&self, id: SubscriberId) -> bool {
        self.state.lock().subscribers.remove(&id).is_some()
    }

    /// Retract every fact matching `predicate`, broadcasting each absence.
    pub fn clear<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(FactKey, &FactValue) -> bool,
    {
        let mut state = self.state.lock();
        let doomed: Vec<FactKey> = state
            .facts
            .iter()
            .filter(|(key, stored)| predicate(**key, &stored.value))
            .map(|(key, _)| *key)
            .collect();
        for key in &doomed {
            let _ = state.facts.remove(key);
            state.broadcast(*key, None, None);
        }
        doomed.len()
    }

    /// Whether anything is worth replicating: a subscriber or a stored fact.
    #[must_use]
    pub fn any(&self) -> bool {
        let state = self.state.lock();
        !state.subscribers.is_empty() || !state.facts.is_empty()
    }

    /// Number of stored facts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().facts.len()
    }

    /// Whether no facts are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().facts.is_empty()
    }

    /// Number of registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// JSON object of every stored fact keyed by the key's display string.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        let state = self.state.lock();
        let map: Map<String, Value> = state
            .facts
            .iter()
            .map(|(key, stored)| (key.to_string(), stored.value.as_value().clone()))
            .collect();
        Value::Object(map)
    }

    fn accept(&self, id: SubscriberId, delivery: &Delivery) -> bool {
        self.state.lock().is_current(id, delivery)
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Hub")
            .field("facts", &state.facts.len())
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subscription
// ─────────────────────────────────────────────────────────────────────────────

/// Live registration on a [`Hub`]. Dropping it deregisters.
pub struct Subscription {
    id: SubscriberId,
    hub: Hub,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    /// Registration handle, usable with [`Hub::off`].
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next valid event. Returns `None` once deregistered.
    ///
    /// Cancel-safe: a dropped `recv` future never loses an accepted event.
    pub async fn recv(&mut self) -> Option<FactEvent> {
        while let Some(delivery) = self.rx.recv().await {
            if let Some(event) = self.validate(delivery) {
                return Some(event);
            }
        }
        None
    }

    /// Next valid event already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<FactEvent> {
        while let Ok(delivery) = self.rx.try_recv() {
            if let Some(event) = self.validate(delivery) {
                return Some(event);
            }
        }
        None
    }

    fn validate(&self, delivery: Delivery) -> Option<FactEvent> {
        self.hub.accept(self.id, &delivery).then(|| FactEvent {
            key: delivery.key,
            value: delivery.value,
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.hub.off(self.id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
