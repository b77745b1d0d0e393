//! Message broker interface.
//!
//! The bus talks to its broker through this trait only; the wire
//! protocol and client library live behind it. An in-memory
//! implementation ships with the crate for tests and single-process
//! deployments.

mod in_memory;

pub use in_memory::InMemoryBroker;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;

/// Header carrying the number of retries already attempted for a group
/// message. Absent means zero.
pub const RETRY_COUNT_HEADER: &str = "retry-count";

/// Header tagging a group message with the bus instance that published
/// it.
pub const ORIGIN_BUS_ID_HEADER: &str = "origin-bus-id";

/// A broker message: opaque payload plus string headers.
#[derive(Clone, Debug, Default)]
pub struct BrokerMessage {
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl BrokerMessage {
    pub fn new(payload: Vec<u8>) -> Self {
        BrokerMessage {
            payload,
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn with_retry_count(self, count: u32) -> Self {
        self.with_header(RETRY_COUNT_HEADER, count.to_string())
    }

    /// Retry count header, defaulting to zero when absent or unparsable.
    pub fn retry_count(&self) -> u32 {
        self.header(RETRY_COUNT_HEADER)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0)
    }
}

/// One message handed to a consumer, holding its prefetch slot until
/// acknowledged.
pub struct Delivery {
    message: BrokerMessage,
    requeue: Option<Box<dyn FnOnce(BrokerMessage) + Send>>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Delivery {
    pub fn new(message: BrokerMessage, permit: OwnedSemaphorePermit) -> Self {
        Delivery {
            message,
            requeue: None,
            _permit: Some(permit),
        }
    }

    /// Install the action that returns this message to its queue when the
    /// delivery is dropped without being acknowledged.
    pub fn with_requeue(mut self, requeue: impl FnOnce(BrokerMessage) + Send + 'static) -> Self {
        self.requeue = Some(Box::new(requeue));
        self
    }

    pub fn message(&self) -> &BrokerMessage {
        &self.message
    }

    /// Acknowledge the message, releasing its prefetch slot. A delivery
    /// dropped without acking goes back to its queue for redelivery, so a
    /// torn-down consumer never swallows messages.
    pub fn ack(mut self) {
        self.requeue = None;
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(requeue) = self.requeue.take() {
            requeue(self.message.clone());
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish()
    }
}

/// An active consumer subscription on one queue.
///
/// Dropping the consumer cancels the subscription. Deliveries already
/// handed out stay valid; buffered ones not yet handed out return to the
/// queue unacked.
pub struct Consumer {
    deliveries: mpsc::Receiver<Delivery>,
    pump: JoinHandle<()>,
}

impl Consumer {
    pub fn new(deliveries: mpsc::Receiver<Delivery>, pump: JoinHandle<()>) -> Self {
        Consumer { deliveries, pump }
    }

    /// Next delivery, or `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Error type for broker operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    UnknownExchange(String),
    UnknownQueue(String),
    /// The broker refused the publish or the confirmation timed out.
    PublishRejected(String),
    ConnectionFailed(String),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::UnknownExchange(name) => write!(f, "unknown exchange `{}`", name),
            BrokerError::UnknownQueue(name) => write!(f, "unknown queue `{}`", name),
            BrokerError::PublishRejected(msg) => write!(f, "publish rejected: {}", msg),
            BrokerError::ConnectionFailed(msg) => write!(f, "broker connection failed: {}", msg),
        }
    }
}

impl std::error::Error for BrokerError {}

/// Minimal broker surface the bus needs: topology declaration, confirmed
/// publishes and competing consumption with manual acknowledgement.
///
/// All declarations are idempotent. `publish` resolves once the broker
/// has confirmed the message; a negative acknowledgement or confirmation
/// timeout surfaces as [`BrokerError::PublishRejected`].
#[async_trait]
pub trait Broker: Send + Sync {
    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError>;

    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: BrokerMessage,
    ) -> Result<(), BrokerError>;

    /// Start consuming `queue` with at most `prefetch` unacknowledged
    /// deliveries in flight.
    async fn consume(&self, queue: &str, prefetch: usize) -> Result<Consumer, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_count_defaults_to_zero() {
        let message = BrokerMessage::new(b"{}".to_vec());
        assert_eq!(message.retry_count(), 0);
    }

    #[test]
    fn retry_count_round_trips_through_headers() {
        let message = BrokerMessage::new(b"{}".to_vec()).with_retry_count(2);
        assert_eq!(message.header(RETRY_COUNT_HEADER), Some("2"));
        assert_eq!(message.retry_count(), 2);
    }

    #[test]
    fn unparsable_retry_count_falls_back_to_zero() {
        let message = BrokerMessage::new(Vec::new()).with_header(RETRY_COUNT_HEADER, "NaN");
        assert_eq!(message.retry_count(), 0);
    }
}
