//! Key/value pub-sub store interface.
//!
//! Carries the ephemeral side of the bus: per-routing-key interest sets
//! (which instances currently want a key) and one message channel per
//! live instance. Best-effort: no durability, no retry.

mod in_memory;

pub use in_memory::InMemoryPubSub;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Separates the `<eventJson>`, `<eventBusId>` and `<routingKey>` parts
/// of a channel message. A control character, so it cannot collide with
/// JSON or identifier text.
pub const MESSAGE_PART_SEPARATOR: char = '\u{1f}';

/// Error type for pub/sub store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubSubError {
    ConnectionFailed(String),
    ChannelClosed(String),
}

impl fmt::Display for PubSubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PubSubError::ConnectionFailed(msg) => {
                write!(f, "pub/sub connection failed: {}", msg)
            }
            PubSubError::ChannelClosed(channel) => {
                write!(f, "pub/sub channel `{}` closed", channel)
            }
        }
    }
}

impl std::error::Error for PubSubError {}

/// An active subscription on one instance channel. Dropping it ends the
/// subscription.
pub struct PubSubSubscription {
    messages: mpsc::Receiver<String>,
}

impl PubSubSubscription {
    pub fn new(messages: mpsc::Receiver<String>) -> Self {
        PubSubSubscription { messages }
    }

    pub async fn next(&mut self) -> Option<String> {
        self.messages.recv().await
    }
}

/// Interest sets plus instance channels.
///
/// Interest entries expire after their TTL unless re-advertised, so a
/// crashed instance stops being addressed without any cleanup step.
#[async_trait]
pub trait PubSubStore: Send + Sync {
    async fn add_interest(
        &self,
        routing_key: &str,
        channel: &str,
        ttl: Duration,
    ) -> Result<(), PubSubError>;

    async fn remove_interest(&self, routing_key: &str, channel: &str) -> Result<(), PubSubError>;

    /// Channel names of instances currently interested in the key.
    async fn interested_channels(&self, routing_key: &str) -> Result<Vec<String>, PubSubError>;

    async fn publish(&self, channel: &str, message: &str) -> Result<(), PubSubError>;

    async fn subscribe(&self, channel: &str) -> Result<PubSubSubscription, PubSubError>;
}
