//! In-memory broker for testing and single-process deployments.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify, Semaphore};

use super::{Broker, BrokerError, BrokerMessage, Consumer, Delivery};

/// In-memory [`Broker`] with direct-exchange routing, competing
/// consumers and prefetch enforcement.
///
/// Multiple bus instances sharing one `InMemoryBroker` (it is `Clone`)
/// see the same topology, which makes multi-node behavior testable in a
/// single process.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    exchanges: Mutex<HashMap<String, Vec<Binding>>>,
    queues: Mutex<HashMap<String, Arc<QueueState>>>,
    /// Number of upcoming publishes to reject, for failure-path tests.
    publish_failures: AtomicUsize,
}

#[derive(Clone, PartialEq, Eq)]
struct Binding {
    routing_key: String,
    queue: String,
}

#[derive(Default)]
struct QueueState {
    messages: Mutex<VecDeque<BrokerMessage>>,
    notify: Notify,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` publishes fail with
    /// [`BrokerError::PublishRejected`].
    pub fn fail_publishes(&self, count: usize) {
        self.inner.publish_failures.store(count, Ordering::SeqCst);
    }

    /// Number of messages currently sitting in a queue.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.inner
            .queues
            .lock()
            .unwrap()
            .get(queue)
            .map(|state| state.messages.lock().unwrap().len())
            .unwrap_or(0)
    }

    fn queue(&self, name: &str) -> Option<Arc<QueueState>> {
        self.inner.queues.lock().unwrap().get(name).cloned()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError> {
        self.inner
            .exchanges
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.inner
            .queues
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        if !self.inner.queues.lock().unwrap().contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }
        let mut exchanges = self.inner.exchanges.lock().unwrap();
        let bindings = exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;
        let binding = Binding {
            routing_key: routing_key.to_string(),
            queue: queue.to_string(),
        };
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: BrokerMessage,
    ) -> Result<(), BrokerError> {
        let failures = &self.inner.publish_failures;
        if failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BrokerError::PublishRejected(
                "injected publish failure".to_string(),
            ));
        }

        let targets: Vec<String> = {
            let exchanges = self.inner.exchanges.lock().unwrap();
            let bindings = exchanges
                .get(exchange)
                .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;
            bindings
                .iter()
                .filter(|binding| binding.routing_key == routing_key)
                .map(|binding| binding.queue.clone())
                .collect()
        };

        // No matching binding drops the message, as a direct exchange would.
        for target in targets {
            if let Some(queue) = self.queue(&target) {
                queue.messages.lock().unwrap().push_back(message.clone());
                queue.notify.notify_one();
            }
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: usize) -> Result<Consumer, BrokerError> {
        let state = self
            .queue(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        let prefetch = prefetch.max(1);
        let (tx, rx) = mpsc::channel(prefetch);
        let slots = Arc::new(Semaphore::new(prefetch));

        let pump = tokio::spawn(async move {
            loop {
                let Ok(permit) = slots.clone().acquire_owned().await else {
                    return;
                };
                let message = loop {
                    let notified = state.notify.notified();
                    if let Some(message) = state.messages.lock().unwrap().pop_front() {
                        break message;
                    }
                    notified.await;
                };
                let requeue_state = state.clone();
                let delivery = Delivery::new(message, permit).with_requeue(move |message| {
                    requeue_state.messages.lock().unwrap().push_front(message);
                    requeue_state.notify.notify_one();
                });
                // A failed send drops the delivery, which requeues it.
                if tx.send(delivery).await.is_err() {
                    return;
                }
            }
        });

        Ok(Consumer::new(rx, pump))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn topology(broker: &InMemoryBroker) {
        broker.declare_exchange("ex").await.unwrap();
        broker.declare_queue("q").await.unwrap();
        broker.bind_queue("q", "ex", "").await.unwrap();
    }

    #[tokio::test]
    async fn published_messages_reach_bound_queues() {
        let broker = InMemoryBroker::new();
        topology(&broker).await;

        broker
            .publish("ex", "", BrokerMessage::new(b"one".to_vec()))
            .await
            .unwrap();

        let mut consumer = broker.consume("q", 1).await.unwrap();
        let delivery = timeout(Duration::from_secs(1), consumer.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.message().payload, b"one");
    }

    #[tokio::test]
    async fn routing_key_must_match_the_binding() {
        let broker = InMemoryBroker::new();
        topology(&broker).await;

        broker
            .publish("ex", "elsewhere", BrokerMessage::new(b"lost".to_vec()))
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("q"), 0);
    }

    #[tokio::test]
    async fn competing_consumers_split_the_queue() {
        let broker = InMemoryBroker::new();
        topology(&broker).await;

        for n in 0..4u8 {
            broker
                .publish("ex", "", BrokerMessage::new(vec![n]))
                .await
                .unwrap();
        }

        let mut first = broker.consume("q", 2).await.unwrap();
        let mut second = broker.consume("q", 2).await.unwrap();
        let mut seen = Vec::new();
        for consumer in [&mut first, &mut second] {
            for _ in 0..2 {
                let delivery = timeout(Duration::from_secs(1), consumer.next())
                    .await
                    .unwrap()
                    .unwrap();
                seen.push(delivery.message().payload[0]);
                delivery.ack();
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn prefetch_bounds_unacked_deliveries() {
        let broker = InMemoryBroker::new();
        topology(&broker).await;

        for _ in 0..3 {
            broker
                .publish("ex", "", BrokerMessage::new(Vec::new()))
                .await
                .unwrap();
        }

        let mut consumer = broker.consume("q", 1).await.unwrap();
        let held = consumer.next().await.unwrap();

        // Second delivery is withheld until the first is acked.
        assert!(timeout(Duration::from_millis(50), consumer.next())
            .await
            .is_err());

        held.ack();
        assert!(timeout(Duration::from_secs(1), consumer.next())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn unacked_deliveries_return_to_the_queue() {
        let broker = InMemoryBroker::new();
        topology(&broker).await;

        broker
            .publish("ex", "", BrokerMessage::new(b"again".to_vec()))
            .await
            .unwrap();

        let mut consumer = broker.consume("q", 1).await.unwrap();
        let delivery = consumer.next().await.unwrap();
        drop(delivery);

        let redelivered = timeout(Duration::from_secs(1), consumer.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(redelivered.message().payload, b"again");
        redelivered.ack();
        assert_eq!(broker.queue_depth("q"), 0);
    }

    #[tokio::test]
    async fn dropping_a_consumer_requeues_its_buffered_messages() {
        let broker = InMemoryBroker::new();
        topology(&broker).await;

        for n in 0..2u8 {
            broker
                .publish("ex", "", BrokerMessage::new(vec![n]))
                .await
                .unwrap();
        }

        let first = broker.consume("q", 2).await.unwrap();
        // Wait for the pump to move both messages into the consumer.
        while broker.queue_depth("q") > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drop(first);
        assert_eq!(broker.queue_depth("q"), 2);

        let mut second = broker.consume("q", 2).await.unwrap();
        let mut seen = Vec::new();
        for _ in 0..2 {
            let delivery = timeout(Duration::from_secs(1), second.next())
                .await
                .unwrap()
                .unwrap();
            seen.push(delivery.message().payload[0]);
            delivery.ack();
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1]);
    }

    #[tokio::test]
    async fn injected_failures_reject_publishes() {
        let broker = InMemoryBroker::new();
        topology(&broker).await;

        broker.fail_publishes(1);
        let err = broker
            .publish("ex", "", BrokerMessage::new(Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::PublishRejected(_)));

        // Subsequent publishes succeed again.
        broker
            .publish("ex", "", BrokerMessage::new(Vec::new()))
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("q"), 1);
    }

    #[tokio::test]
    async fn publishing_to_an_undeclared_exchange_fails() {
        let broker = InMemoryBroker::new();
        let err = broker
            .publish("ghost", "", BrokerMessage::new(Vec::new()))
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::UnknownExchange("ghost".to_string()));
    }
}
