//! Durable group consumption: competing consumers, retry and
//! dead-lettering.
//!
//! Each registered group owns one durable work queue bound to the main
//! exchange and one retry exchange bound back to that same queue. A
//! failed delivery is republished through the retry exchange with an
//! incremented retry-count header (never requeued in place), and once
//! the group's retry budget is exhausted the event moves to the
//! dead-letter store. The work queue itself keeps flowing either way.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, warn};

use crate::broker::{Broker, BrokerMessage, Consumer, Delivery};
use crate::deadletter::EventDeadLetters;
use crate::error::BusError;
use crate::event::{Event, EventSerializer};
use crate::group::Group;
use crate::listener::{EventListener, Registration};
use crate::naming::NamingStrategy;
use crate::retry::{RetryBackoff, WaitDelayGenerator};

/// Decides, per failed delivery, between requeue-with-incremented-count
/// and dead-letter escalation.
pub(crate) struct GroupConsumerRetry {
    broker: Arc<dyn Broker>,
    dead_letters: Arc<dyn EventDeadLetters>,
    serializer: Arc<dyn EventSerializer>,
    retry_exchange: String,
    group: Group,
    max_retries: u32,
}

impl GroupConsumerRetry {
    async fn retry_or_store(&self, event: Arc<dyn Event>, current_retry: u32) {
        if current_retry >= self.max_retries {
            self.store(event).await;
            return;
        }
        self.publish_retry(event, current_retry + 1).await;
    }

    /// Operational replay: hand the event back to this group's queue
    /// with a fresh retry budget.
    async fn re_deliver(&self, event: Arc<dyn Event>) {
        self.publish_retry(event, 0).await;
    }

    async fn publish_retry(&self, event: Arc<dyn Event>, retry_count: u32) {
        let bytes = match self.serializer.to_bytes(event.as_ref()) {
            Ok(bytes) => bytes,
            Err(err) => {
                // The event deserialized moments ago; failing to encode it
                // again means it can only be retained as a dead letter.
                warn!(group = %self.group, error = %err, "could not encode retry message");
                self.store(event).await;
                return;
            }
        };
        let message = BrokerMessage::new(bytes).with_retry_count(retry_count);
        if let Err(err) = self.broker.publish(&self.retry_exchange, "", message).await {
            warn!(
                group = %self.group,
                event_id = %event.event_id(),
                error = %err,
                "retry publish failed, escalating to dead letters",
            );
            self.store(event).await;
        }
    }

    async fn store(&self, event: Arc<dyn Event>) {
        if let Err(err) = self.dead_letters.store(&self.group, event.clone()).await {
            error!(
                group = %self.group,
                event_id = %event.event_id(),
                error = %err,
                "dead letter store failed, event is lost for this group",
            );
        }
    }
}

/// Per-group consumption pipeline shared between the consumer task and
/// the handler.
struct GroupConsumerContext {
    group: Group,
    listener: Arc<dyn EventListener>,
    serializer: Arc<dyn EventSerializer>,
    retry: GroupConsumerRetry,
    delay: WaitDelayGenerator,
    listener_timeout: Duration,
    concurrency: usize,
}

impl GroupConsumerContext {
    async fn handle_delivery(&self, delivery: Delivery) {
        let retry_count = delivery.message().retry_count();
        let event = match self.serializer.from_bytes(&delivery.message().payload) {
            Ok(event) => event,
            Err(err) => {
                error!(group = %self.group, error = %err, "undecodable group message dropped");
                delivery.ack();
                return;
            }
        };
        if event.is_noop() {
            delivery.ack();
            return;
        }

        let wait = self.delay.delay(retry_count);
        if !wait.is_zero() {
            sleep(wait).await;
        }

        match timeout(self.listener_timeout, self.listener.event(event.clone())).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(
                    group = %self.group,
                    event_id = %event.event_id(),
                    retry_count,
                    error = %err,
                    "group listener failed",
                );
                self.retry.retry_or_store(event, retry_count).await;
            }
            Err(_) => {
                warn!(
                    group = %self.group,
                    event_id = %event.event_id(),
                    retry_count,
                    "group listener timed out",
                );
                self.retry.retry_or_store(event, retry_count).await;
            }
        }
        delivery.ack();
    }
}

struct GroupConsumerHandle {
    context: Arc<GroupConsumerContext>,
    task: JoinHandle<()>,
}

/// Owns every active group pipeline of one bus instance, from
/// registration to teardown.
pub(crate) struct GroupRegistrationHandler {
    naming: NamingStrategy,
    broker: Arc<dyn Broker>,
    serializer: Arc<dyn EventSerializer>,
    dead_letters: Arc<dyn EventDeadLetters>,
    backoff: RetryBackoff,
    concurrency: usize,
    prefetch: usize,
    listener_timeout: Duration,
    groups: Mutex<HashMap<Group, GroupConsumerHandle>>,
}

impl GroupRegistrationHandler {
    pub(crate) fn new(
        naming: NamingStrategy,
        broker: Arc<dyn Broker>,
        serializer: Arc<dyn EventSerializer>,
        dead_letters: Arc<dyn EventDeadLetters>,
        backoff: RetryBackoff,
        concurrency: usize,
        prefetch: usize,
        listener_timeout: Duration,
    ) -> Self {
        GroupRegistrationHandler {
            naming,
            broker,
            serializer,
            dead_letters,
            backoff,
            concurrency,
            prefetch,
            listener_timeout,
            groups: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn register(
        self: &Arc<Self>,
        listener: Arc<dyn EventListener>,
        group: Group,
    ) -> Result<GroupRegistration, BusError> {
        if self.groups.lock().unwrap().contains_key(&group) {
            return Err(BusError::GroupAlreadyRegistered(group));
        }

        self.declare_group_topology(&group).await?;
        let context = Arc::new(GroupConsumerContext {
            group: group.clone(),
            listener,
            serializer: self.serializer.clone(),
            retry: GroupConsumerRetry {
                broker: self.broker.clone(),
                dead_letters: self.dead_letters.clone(),
                serializer: self.serializer.clone(),
                retry_exchange: self.naming.retry_exchange(&group),
                group: group.clone(),
                max_retries: self.backoff.max_retries(),
            },
            delay: WaitDelayGenerator::new(self.backoff),
            listener_timeout: self.listener_timeout,
            concurrency: self.concurrency,
        });
        let task = self.start_consumer(context.clone()).await?;

        {
            let mut groups = self.groups.lock().unwrap();
            if !groups.contains_key(&group) {
                groups.insert(group.clone(), GroupConsumerHandle { context, task });
                debug!(group = %group, "group registered");
                return Ok(GroupRegistration {
                    handler: self.clone(),
                    group,
                    active: AtomicBool::new(true),
                });
            }
        }
        // Lost a registration race; fully tear down the extra consumer
        // before reporting the conflict.
        task.abort();
        let _ = task.await;
        Err(BusError::GroupAlreadyRegistered(group))
    }

    /// Declares the queue/exchange pair for a group. Idempotent and
    /// durable: other fleet instances sharing the group reuse it.
    async fn declare_group_topology(&self, group: &Group) -> Result<(), BusError> {
        let queue = self.naming.group_queue(group);
        let retry_exchange = self.naming.retry_exchange(group);
        self.broker.declare_queue(&queue).await?;
        self.broker
            .bind_queue(&queue, &self.naming.exchange(), "")
            .await?;
        self.broker.declare_exchange(&retry_exchange).await?;
        self.broker.bind_queue(&queue, &retry_exchange, "").await?;
        Ok(())
    }

    async fn start_consumer(
        &self,
        context: Arc<GroupConsumerContext>,
    ) -> Result<JoinHandle<()>, BusError> {
        let queue = self.naming.group_queue(&context.group);
        let consumer = self.broker.consume(&queue, self.prefetch).await?;
        Ok(tokio::spawn(consume_loop(context, consumer)))
    }

    /// Tear down the group's consumer. Awaits the abort so no stale
    /// consumer competes with a successor; deliveries the old consumer
    /// had buffered but not acknowledged return to the work queue.
    pub(crate) async fn unregister(&self, group: &Group) {
        let handle = self.groups.lock().unwrap().remove(group);
        if let Some(handle) = handle {
            handle.task.abort();
            let _ = handle.task.await;
            debug!(group = %group, "group unregistered");
        }
    }

    /// Replace every group's consumer subscription with a fresh one,
    /// used after broker reconnection. Topology is not re-declared. Each
    /// old consumer is fully torn down (returning its unacked deliveries
    /// to the queue) before its replacement starts competing.
    pub(crate) async fn restart(&self) -> Result<(), BusError> {
        let contexts: Vec<Arc<GroupConsumerContext>> = {
            let groups = self.groups.lock().unwrap();
            groups.values().map(|handle| handle.context.clone()).collect()
        };
        for context in contexts {
            let previous = self.groups.lock().unwrap().remove(&context.group);
            let Some(previous) = previous else {
                // Unregistered while restarting.
                continue;
            };
            previous.task.abort();
            let _ = previous.task.await;
            let task = self.start_consumer(context.clone()).await?;
            let mut groups = self.groups.lock().unwrap();
            if groups.contains_key(&context.group) {
                // Re-registered while restarting.
                task.abort();
            } else {
                groups.insert(context.group.clone(), GroupConsumerHandle { context, task });
            }
        }
        Ok(())
    }

    pub(crate) async fn stop(&self) {
        let handles: Vec<GroupConsumerHandle> = {
            let mut groups = self.groups.lock().unwrap();
            groups.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.task.abort();
            let _ = handle.task.await;
        }
    }

    pub(crate) async fn re_deliver(
        &self,
        group: &Group,
        event: Arc<dyn Event>,
    ) -> Result<(), BusError> {
        let context = self
            .groups
            .lock()
            .unwrap()
            .get(group)
            .map(|handle| handle.context.clone())
            .ok_or_else(|| BusError::GroupNotRegistered(group.clone()))?;
        context.retry.re_deliver(event).await;
        Ok(())
    }

    pub(crate) fn registered_groups(&self) -> Vec<Group> {
        self.groups.lock().unwrap().keys().cloned().collect()
    }
}

/// Feeds deliveries into per-delivery tasks, bounded by the group's
/// worker pool size.
async fn consume_loop(context: Arc<GroupConsumerContext>, mut consumer: Consumer) {
    let pool = Arc::new(Semaphore::new(context.concurrency.max(1)));
    while let Some(delivery) = consumer.next().await {
        let Ok(permit) = pool.clone().acquire_owned().await else {
            return;
        };
        let context = context.clone();
        tokio::spawn(async move {
            context.handle_delivery(delivery).await;
            drop(permit);
        });
    }
}

/// Handle for one group registration. The queue/exchange topology stays
/// in place after `unregister` so other instances keep working.
pub struct GroupRegistration {
    handler: Arc<GroupRegistrationHandler>,
    group: Group,
    active: AtomicBool,
}

impl GroupRegistration {
    pub fn group(&self) -> &Group {
        &self.group
    }
}

#[async_trait]
impl Registration for GroupRegistration {
    async fn unregister(&self) -> Result<(), BusError> {
        if self.active.swap(false, Ordering::SeqCst) {
            self.handler.unregister(&self.group).await;
        }
        Ok(())
    }
}
