//! In-memory dead-letter store for testing and single-process
//! deployments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{DeadLetterError, EventDeadLetters};
use crate::event::{Event, EventId};
use crate::group::Group;

/// In-memory [`EventDeadLetters`]. `Clone` shares the underlying state.
#[derive(Clone, Default)]
pub struct InMemoryDeadLetters {
    inner: Arc<Mutex<HashMap<Group, Vec<Arc<dyn Event>>>>>,
}

impl InMemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a given event is dead-lettered under a group.
    pub fn contains(&self, group: &Group, event_id: EventId) -> bool {
        self.inner
            .lock()
            .unwrap()
            .get(group)
            .map(|events| events.iter().any(|event| event.event_id() == event_id))
            .unwrap_or(false)
    }
}

#[async_trait]
impl EventDeadLetters for InMemoryDeadLetters {
    async fn store(&self, group: &Group, event: Arc<dyn Event>) -> Result<(), DeadLetterError> {
        self.inner
            .lock()
            .unwrap()
            .entry(group.clone())
            .or_default()
            .push(event);
        Ok(())
    }

    async fn group_events(&self, group: &Group) -> Result<Vec<Arc<dyn Event>>, DeadLetterError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .get(group)
            .cloned()
            .unwrap_or_default())
    }

    async fn remove(&self, group: &Group, event_id: EventId) -> Result<(), DeadLetterError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(events) = inner.get_mut(group) {
            events.retain(|event| event.event_id() != event_id);
            if events.is_empty() {
                inner.remove(group);
            }
        }
        Ok(())
    }

    async fn groups_with_failures(&self) -> Result<Vec<Group>, DeadLetterError> {
        Ok(self.inner.lock().unwrap().keys().cloned().collect())
    }
}
