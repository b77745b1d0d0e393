//! The publish path.
//!
//! `dispatch` fans one event out three ways: inline to this instance's
//! synchronous key listeners, durably to every registered group via the
//! broker's main exchange, and best-effort to every other live instance
//! interested in one of the keys via the pub/sub store. The local and
//! remote phases run concurrently and neither short-circuits the other.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{error, warn};

use crate::broker::{Broker, BrokerMessage, ORIGIN_BUS_ID_HEADER};
use crate::deadletter::EventDeadLetters;
use crate::error::BusError;
use crate::event::{Event, EventBusId, EventSerializer};
use crate::group::Group;
use crate::key::RoutingKey;
use crate::listener::{EventListener, ExecutionMode};
use crate::naming::NamingStrategy;
use crate::pubsub::{PubSubStore, MESSAGE_PART_SEPARATOR};
use crate::registry::LocalListenerRegistry;
use crate::retry::{RetryBackoff, WaitDelayGenerator};

pub(crate) struct EventDispatcher {
    bus_id: EventBusId,
    naming: NamingStrategy,
    broker: Arc<dyn Broker>,
    pubsub: Arc<dyn PubSubStore>,
    dead_letters: Arc<dyn EventDeadLetters>,
    serializer: Arc<dyn EventSerializer>,
    registry: Arc<LocalListenerRegistry>,
    backoff: RetryBackoff,
    delay: WaitDelayGenerator,
    listener_timeout: Duration,
    dispatching_failure: Group,
}

impl EventDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        bus_id: EventBusId,
        naming: NamingStrategy,
        broker: Arc<dyn Broker>,
        pubsub: Arc<dyn PubSubStore>,
        dead_letters: Arc<dyn EventDeadLetters>,
        serializer: Arc<dyn EventSerializer>,
        registry: Arc<LocalListenerRegistry>,
        backoff: RetryBackoff,
        listener_timeout: Duration,
    ) -> Self {
        let dispatching_failure = Group::dispatching_failure(naming.bus_name());
        EventDispatcher {
            bus_id,
            naming,
            broker,
            pubsub,
            dead_letters,
            serializer,
            registry,
            backoff,
            delay: WaitDelayGenerator::new(backoff),
            listener_timeout,
            dispatching_failure,
        }
    }

    pub(crate) async fn dispatch(
        &self,
        event: Arc<dyn Event>,
        keys: Vec<RoutingKey>,
    ) -> Result<(), BusError> {
        if event.is_noop() {
            return Ok(());
        }
        let (_, remote) = tokio::join!(
            self.execute_local_synchronous(&event, &keys),
            self.dispatch_remote(&event, &keys),
        );
        remote
    }

    /// Inline execution of this instance's synchronous key listeners.
    /// One listener's failure must not affect its siblings or the
    /// caller, so everything is logged and swallowed here.
    async fn execute_local_synchronous(&self, event: &Arc<dyn Event>, keys: &[RoutingKey]) {
        let mut invoked: Vec<Arc<dyn EventListener>> = Vec::new();
        for key in keys {
            for listener in self.registry.listeners(key) {
                if listener.execution_mode() != ExecutionMode::Synchronous {
                    continue;
                }
                if invoked.iter().any(|seen| Arc::ptr_eq(seen, &listener)) {
                    continue;
                }
                match timeout(self.listener_timeout, listener.event(event.clone())).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!(
                        routing_key = %key,
                        event_id = %event.event_id(),
                        error = %err,
                        "synchronous listener failed",
                    ),
                    Err(_) => warn!(
                        routing_key = %key,
                        event_id = %event.event_id(),
                        "synchronous listener timed out",
                    ),
                }
                invoked.push(listener);
            }
        }
    }

    async fn dispatch_remote(
        &self,
        event: &Arc<dyn Event>,
        keys: &[RoutingKey],
    ) -> Result<(), BusError> {
        let bytes = self.serializer.to_bytes(event.as_ref())?;
        let json = self.serializer.to_json(event.as_ref())?;
        let (groups, _) = tokio::join!(
            self.broadcast_serialized_to_groups(bytes, event),
            self.broadcast_to_keys(&json, keys),
        );
        groups
    }

    /// Durable broadcast to every registered group, wherever registered.
    /// Also used by `re_deliver` for the dispatching-failure group.
    pub(crate) async fn broadcast_to_groups(&self, event: &Arc<dyn Event>) -> Result<(), BusError> {
        let bytes = self.serializer.to_bytes(event.as_ref())?;
        self.broadcast_serialized_to_groups(bytes, event).await
    }

    async fn broadcast_serialized_to_groups(
        &self,
        bytes: Vec<u8>,
        event: &Arc<dyn Event>,
    ) -> Result<(), BusError> {
        let exchange = self.naming.exchange();
        let message = BrokerMessage::new(bytes)
            .with_retry_count(0)
            .with_header(ORIGIN_BUS_ID_HEADER, self.bus_id.to_string());

        let mut attempt = 0u32;
        loop {
            match self.broker.publish(&exchange, "", message.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    attempt += 1;
                    if attempt > self.backoff.max_retries() {
                        error!(
                            event_id = %event.event_id(),
                            error = %err,
                            "group broadcast exhausted publish retries, storing to dead letters",
                        );
                        self.dead_letters
                            .store(&self.dispatching_failure, event.clone())
                            .await?;
                        return Ok(());
                    }
                    warn!(
                        event_id = %event.event_id(),
                        attempt,
                        error = %err,
                        "group broadcast publish failed, retrying",
                    );
                    sleep(self.delay.delay(attempt)).await;
                }
            }
        }
    }

    /// Best-effort fan-out to the instances currently interested in the
    /// given keys. Keys without subscribers are a silent no-op; store
    /// failures are logged and swallowed.
    async fn broadcast_to_keys(&self, json: &str, keys: &[RoutingKey]) {
        for key in keys {
            let channels = match self.pubsub.interested_channels(key.as_str()).await {
                Ok(channels) => channels,
                Err(err) => {
                    warn!(routing_key = %key, error = %err, "could not resolve interest set");
                    continue;
                }
            };
            if channels.is_empty() {
                continue;
            }
            let message = format!(
                "{json}{sep}{bus_id}{sep}{key}",
                sep = MESSAGE_PART_SEPARATOR,
                bus_id = self.bus_id,
            );
            for channel in channels {
                if let Err(err) = self.pubsub.publish(&channel, &message).await {
                    warn!(
                        routing_key = %key,
                        channel = %channel,
                        error = %err,
                        "key broadcast publish failed",
                    );
                }
            }
        }
    }
}
