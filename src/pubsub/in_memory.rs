//! In-memory pub/sub store for testing and single-process deployments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{PubSubError, PubSubStore, PubSubSubscription};

const CHANNEL_BUFFER: usize = 1024;

/// In-memory [`PubSubStore`]. `Clone` shares the underlying state, so
/// several bus instances can be wired to one store in tests.
#[derive(Clone, Default)]
pub struct InMemoryPubSub {
    inner: Arc<Mutex<PubSubInner>>,
}

#[derive(Default)]
struct PubSubInner {
    /// routing key -> channel name -> expiry instant
    interest: HashMap<String, HashMap<String, Instant>>,
    subscribers: HashMap<String, Vec<mpsc::Sender<String>>>,
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PubSubStore for InMemoryPubSub {
    async fn add_interest(
        &self,
        routing_key: &str,
        channel: &str,
        ttl: Duration,
    ) -> Result<(), PubSubError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .interest
            .entry(routing_key.to_string())
            .or_default()
            .insert(channel.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn remove_interest(&self, routing_key: &str, channel: &str) -> Result<(), PubSubError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(channels) = inner.interest.get_mut(routing_key) {
            channels.remove(channel);
            if channels.is_empty() {
                inner.interest.remove(routing_key);
            }
        }
        Ok(())
    }

    async fn interested_channels(&self, routing_key: &str) -> Result<Vec<String>, PubSubError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let Some(channels) = inner.interest.get_mut(routing_key) else {
            return Ok(Vec::new());
        };
        channels.retain(|_, expiry| *expiry > now);
        Ok(channels.keys().cloned().collect())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), PubSubError> {
        let senders: Vec<mpsc::Sender<String>> = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(senders) = inner.subscribers.get_mut(channel) {
                senders.retain(|sender| !sender.is_closed());
                senders.clone()
            } else {
                Vec::new()
            }
        };
        // Subscriber-less channels swallow the message, like any pub/sub.
        for sender in senders {
            let _ = sender.send(message.to_string()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<PubSubSubscription, PubSubError> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        self.inner
            .lock()
            .unwrap()
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(PubSubSubscription::new(rx))
    }
}
