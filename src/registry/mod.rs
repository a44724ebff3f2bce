//! Subscription registry
//!
//! The registry is the authoritative set of topic subscriptions held by a
//! control table. Entries are keyed by topic, so every topic appears at most
//! once and enumeration comes out sorted.
//!
//! Broker round-trips never happen under the registry lock. Instead a topic is
//! first reserved (`begin_insert`) or marked for removal (`begin_remove`), the
//! lock is released for the broker call, and the returned guard then commits
//! or rolls back. A reserved topic already counts as present, so two
//! concurrent inserts of the same topic cannot both reach the broker.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rumqttc::QoS;

use crate::utils::error::{BridgeError, Result};


/// One active subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    pub qos: QoS,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    /// Subscribe is in flight; not yet visible.
    Adding,
    Active,
    /// Unsubscribe is in flight; still visible.
    Removing,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    qos: QoS,
    state: EntryState,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserves `topic` for a subscribe. Fails if the topic is present in any
    /// state.
    pub fn begin_insert(&self, topic: &str, qos: QoS) -> Result<PendingInsert<'_>> {
        let mut entries = self.entries();
        if entries.contains_key(topic) {
            return Err(BridgeError::AlreadySubscribed(topic.to_string()));
        }
        entries.insert(
            topic.to_string(),
            Entry {
                qos,
                state: EntryState::Adding,
            },
        );
        Ok(PendingInsert {
            registry: self,
            topic: topic.to_string(),
            done: false,
        })
    }

    /// Marks an active `topic` for removal and returns its QoS with the guard.
    pub fn begin_remove(&self, topic: &str) -> Result<PendingRemove<'_>> {
        let mut entries = self.entries();
        match entries.get_mut(topic) {
            Some(entry) if entry.state == EntryState::Active => {
                entry.state = EntryState::Removing;
                Ok(PendingRemove {
                    registry: self,
                    topic: topic.to_string(),
                    qos: entry.qos,
                    done: false,
                })
            }
            _ => Err(BridgeError::NotSubscribed(topic.to_string())),
        }
    }

    /// Point-in-time copy of the visible subscriptions, sorted by topic.
    pub fn snapshot(&self) -> Vec<Subscription> {
        self.entries()
            .iter()
            .filter(|(_, entry)| entry.state != EntryState::Adding)
            .map(|(topic, entry)| Subscription {
                topic: topic.clone(),
                qos: entry.qos,
            })
            .collect()
    }

    pub fn topics(&self) -> Vec<String> {
        self.snapshot().into_iter().map(|s| s.topic).collect()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.entries()
            .get(topic)
            .is_some_and(|entry| entry.state != EntryState::Adding)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops `topic` unconditionally, used once teardown unsubscribed it.
    pub fn forget(&self, topic: &str) {
        self.entries().remove(topic);
    }
}

/// A reserved topic awaiting the broker's SUBACK. Dropping it without
/// `commit` releases the reservation.
#[derive(Debug)]
pub struct PendingInsert<'a> {
    registry: &'a SubscriptionRegistry,
    topic: String,
    done: bool,
}

impl PendingInsert<'_> {
    pub fn commit(mut self) {
        if let Some(entry) = self.registry.entries().get_mut(&self.topic) {
            entry.state = EntryState::Active;
        }
        self.done = true;
    }
}

impl Drop for PendingInsert<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.registry.entries().remove(&self.topic);
        }
    }
}

/// A topic awaiting the broker's UNSUBACK. Dropping it without `commit`
/// restores the entry.
#[derive(Debug)]
pub struct PendingRemove<'a> {
    registry: &'a SubscriptionRegistry,
    topic: String,
    qos: QoS,
    done: bool,
}

impl PendingRemove<'_> {
    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn commit(mut self) {
        self.registry.entries().remove(&self.topic);
        self.done = true;
    }
}

impl Drop for PendingRemove<'_> {
    fn drop(&mut self) {
        if !self.done {
            if let Some(entry) = self.registry.entries().get_mut(&self.topic) {
                entry.state = EntryState::Active;
            }
        }
    }
}
