//! Ephemeral key-addressed delivery.
//!
//! Every bus instance owns one pub/sub channel. Registering a listener
//! for a key advertises this instance's channel in the key's interest
//! set (with a TTL, refreshed while interest persists); dispatching with
//! that key publishes to every advertised channel. Loop-back messages
//! (the instance's own events echoed back through its channel) skip
//! synchronous listeners, which already ran inline at publish time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, warn};

use crate::error::BusError;
use crate::event::{EventBusId, EventSerializer};
use crate::key::{RegistrationKey, RoutingKey, RoutingKeyConverter};
use crate::listener::{EventListener, ExecutionMode, Registration};
use crate::pubsub::{PubSubStore, PubSubSubscription, MESSAGE_PART_SEPARATOR};
use crate::registry::{ListenerAdded, ListenerRemoved, LocalListenerRegistry};

#[derive(Default)]
struct KeyConsumerTasks {
    receiver: Option<JoinHandle<()>>,
    refresher: Option<JoinHandle<()>>,
}

pub(crate) struct KeyRegistrationHandler {
    bus_id: EventBusId,
    channel: String,
    pubsub: Arc<dyn PubSubStore>,
    serializer: Arc<dyn EventSerializer>,
    converter: Arc<RoutingKeyConverter>,
    registry: Arc<LocalListenerRegistry>,
    interest_ttl: Duration,
    listener_timeout: Duration,
    concurrency: usize,
    tasks: Mutex<KeyConsumerTasks>,
}

impl KeyRegistrationHandler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        bus_id: EventBusId,
        channel: String,
        pubsub: Arc<dyn PubSubStore>,
        serializer: Arc<dyn EventSerializer>,
        converter: Arc<RoutingKeyConverter>,
        registry: Arc<LocalListenerRegistry>,
        interest_ttl: Duration,
        listener_timeout: Duration,
        concurrency: usize,
    ) -> Self {
        KeyRegistrationHandler {
            bus_id,
            channel,
            pubsub,
            serializer,
            converter,
            registry,
            interest_ttl,
            listener_timeout,
            concurrency,
            tasks: Mutex::new(KeyConsumerTasks::default()),
        }
    }

    /// Subscribe this instance's own channel and start refreshing
    /// interest TTLs.
    pub(crate) async fn start(self: &Arc<Self>) -> Result<(), BusError> {
        let subscription = self.pubsub.subscribe(&self.channel).await?;
        let mut tasks = self.tasks.lock().unwrap();
        tasks.receiver = Some(tokio::spawn(receive_loop(self.clone(), subscription)));
        tasks.refresher = Some(tokio::spawn(refresh_loop(self.clone())));
        debug!(channel = %self.channel, "key consumption started");
        Ok(())
    }

    pub(crate) fn stop(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(task) = tasks.receiver.take() {
            task.abort();
        }
        if let Some(task) = tasks.refresher.take() {
            task.abort();
        }
        // Remaining interest entries age out via their TTL.
    }

    /// Re-subscribe the instance channel after a connection loss.
    pub(crate) async fn restart(self: &Arc<Self>) -> Result<(), BusError> {
        self.stop();
        self.start().await
    }

    pub(crate) async fn register(
        self: &Arc<Self>,
        listener: Arc<dyn EventListener>,
        key: &dyn RegistrationKey,
    ) -> Result<KeyRegistration, BusError> {
        let routing_key = RoutingKey::of(key);
        let added = self.registry.add(routing_key.clone(), listener.clone());
        if added == ListenerAdded::FirstForKey {
            self.pubsub
                .add_interest(routing_key.as_str(), &self.channel, self.interest_ttl)
                .await?;
        }
        Ok(KeyRegistration {
            handler: self.clone(),
            routing_key,
            listener,
            active: AtomicBool::new(true),
        })
    }

    async fn unregister(
        &self,
        routing_key: &RoutingKey,
        listener: &Arc<dyn EventListener>,
    ) -> Result<(), BusError> {
        if self.registry.remove(routing_key, listener) == ListenerRemoved::LastForKey {
            self.pubsub
                .remove_interest(routing_key.as_str(), &self.channel)
                .await?;
        }
        Ok(())
    }

    /// Handle one `<eventJson><sep><busId><sep><routingKey>` message
    /// received on this instance's channel.
    async fn handle_message(&self, raw: &str) -> Result<(), BusError> {
        let mut parts = raw.rsplitn(3, MESSAGE_PART_SEPARATOR);
        let (Some(routing_key), Some(origin), Some(json)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(BusError::MalformedKeyMessage(raw.to_string()));
        };

        let routing_key = RoutingKey::from_wire(routing_key);
        // Unroutable keys mean a missing factory; fail hard, no recovery.
        self.converter.to_registration_key(&routing_key)?;
        let origin = EventBusId::parse(origin)?;
        let event = self.serializer.from_bytes(json.as_bytes())?;

        let local_echo = origin == self.bus_id;
        for listener in self.registry.listeners(&routing_key) {
            // A synchronous listener on the origin node already ran
            // inline at publish time.
            if local_echo && listener.execution_mode() == ExecutionMode::Synchronous {
                continue;
            }
            match timeout(self.listener_timeout, listener.event(event.clone())).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    routing_key = %routing_key,
                    event_id = %event.event_id(),
                    error = %err,
                    "key listener failed",
                ),
                Err(_) => warn!(
                    routing_key = %routing_key,
                    event_id = %event.event_id(),
                    "key listener timed out",
                ),
            }
        }
        Ok(())
    }
}

/// Feeds channel messages into per-message tasks, bounded by the key
/// path's own worker pool so one stuck listener cannot stall the other
/// keys of this instance.
async fn receive_loop(handler: Arc<KeyRegistrationHandler>, mut subscription: PubSubSubscription) {
    let pool = Arc::new(Semaphore::new(handler.concurrency.max(1)));
    while let Some(message) = subscription.next().await {
        let Ok(permit) = pool.clone().acquire_owned().await else {
            return;
        };
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(err) = handler.handle_message(&message).await {
                error!(channel = %handler.channel, error = %err, "cannot handle key delivery");
            }
            drop(permit);
        });
    }
}

/// Re-advertises every locally registered key at half the TTL, so live
/// interest never expires while stale instances age out.
async fn refresh_loop(handler: Arc<KeyRegistrationHandler>) {
    let period = (handler.interest_ttl / 2).max(Duration::from_millis(1));
    loop {
        sleep(period).await;
        for routing_key in handler.registry.routing_keys() {
            if let Err(err) = handler
                .pubsub
                .add_interest(routing_key.as_str(), &handler.channel, handler.interest_ttl)
                .await
            {
                warn!(routing_key = %routing_key, error = %err, "interest refresh failed");
            }
        }
    }
}

/// Handle for one key registration.
pub struct KeyRegistration {
    handler: Arc<KeyRegistrationHandler>,
    routing_key: RoutingKey,
    listener: Arc<dyn EventListener>,
    active: AtomicBool,
}

impl KeyRegistration {
    pub fn routing_key(&self) -> &RoutingKey {
        &self.routing_key
    }
}

#[async_trait]
impl Registration for KeyRegistration {
    async fn unregister(&self) -> Result<(), BusError> {
        if self.active.swap(false, Ordering::SeqCst) {
            self.handler
                .unregister(&self.routing_key, &self.listener)
                .await?;
        }
        Ok(())
    }
}
