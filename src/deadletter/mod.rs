//! Dead-letter store interface.
//!
//! Events a group could not process within its retry budget are retained
//! here instead of being dropped, keyed by group, so operational tooling
//! can inspect and replay them through `EventBus::re_deliver`.

mod in_memory;

pub use in_memory::InMemoryDeadLetters;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::event::{Event, EventId};
use crate::group::Group;

/// Error type for dead-letter store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterError {
    StoreFailed(String),
}

impl fmt::Display for DeadLetterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadLetterError::StoreFailed(msg) => write!(f, "dead letter store failed: {}", msg),
        }
    }
}

impl std::error::Error for DeadLetterError {}

/// Persistence for events abandoned by a group's retry loop.
#[async_trait]
pub trait EventDeadLetters: Send + Sync {
    async fn store(&self, group: &Group, event: Arc<dyn Event>) -> Result<(), DeadLetterError>;

    async fn group_events(&self, group: &Group) -> Result<Vec<Arc<dyn Event>>, DeadLetterError>;

    /// Remove one stored event, typically after a successful replay.
    async fn remove(&self, group: &Group, event_id: EventId) -> Result<(), DeadLetterError>;

    /// Groups that currently have at least one dead-lettered event.
    async fn groups_with_failures(&self) -> Result<Vec<Group>, DeadLetterError>;
}
