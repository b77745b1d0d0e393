//! Process-local bookkeeping of key-registered listeners.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::key::RoutingKey;
use crate::listener::EventListener;

/// Outcome of adding a listener under a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerAdded {
    /// No listener was registered for this key before; the caller must
    /// advertise interest to the rest of the fleet.
    FirstForKey,
    AddedToExisting,
    /// This exact listener instance was already registered under the key;
    /// duplicate registrations collapse into one entry.
    AlreadyRegistered,
}

/// Outcome of removing a listener from a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerRemoved {
    /// The key has no local listeners left; the caller must withdraw
    /// interest.
    LastForKey,
    RemainingListeners,
    NotFound,
}

/// Map from routing key to the set of locally registered listeners.
///
/// One instance per bus, created by the facade and shared by reference
/// with both delivery handlers. Listener identity is the `Arc` pointer,
/// so the same listener object registered twice under one key counts
/// once.
#[derive(Default)]
pub struct LocalListenerRegistry {
    entries: RwLock<HashMap<RoutingKey, Vec<Arc<dyn EventListener>>>>,
}

impl LocalListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, key: RoutingKey, listener: Arc<dyn EventListener>) -> ListenerAdded {
        let mut entries = self.entries.write().unwrap();
        match entries.get_mut(&key) {
            None => {
                entries.insert(key, vec![listener]);
                ListenerAdded::FirstForKey
            }
            Some(listeners) => {
                if listeners.iter().any(|other| Arc::ptr_eq(other, &listener)) {
                    ListenerAdded::AlreadyRegistered
                } else {
                    listeners.push(listener);
                    ListenerAdded::AddedToExisting
                }
            }
        }
    }

    pub fn remove(&self, key: &RoutingKey, listener: &Arc<dyn EventListener>) -> ListenerRemoved {
        let mut entries = self.entries.write().unwrap();
        let Some(listeners) = entries.get_mut(key) else {
            return ListenerRemoved::NotFound;
        };
        let before = listeners.len();
        listeners.retain(|other| !Arc::ptr_eq(other, listener));
        if listeners.len() == before {
            return ListenerRemoved::NotFound;
        }
        if listeners.is_empty() {
            entries.remove(key);
            ListenerRemoved::LastForKey
        } else {
            ListenerRemoved::RemainingListeners
        }
    }

    pub fn listeners(&self, key: &RoutingKey) -> Vec<Arc<dyn EventListener>> {
        self.entries
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// All keys with at least one local listener, used by the interest
    /// refresh loop.
    pub fn routing_keys(&self) -> Vec<RoutingKey> {
        self.entries.read().unwrap().keys().cloned().collect()
    }

    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }
}
