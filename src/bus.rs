//! The event bus facade.
//!
//! Composes the dispatcher and both delivery handlers behind
//! `register`/`dispatch`/`re_deliver` and owns the bus lifecycle. The
//! handlers are constructed with only the narrow collaborators they need
//! (broker, serializer, dead letters, retry policy), never a reference
//! back to the facade.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::broker::Broker;
use crate::deadletter::EventDeadLetters;
use crate::dispatcher::EventDispatcher;
use crate::error::BusError;
use crate::event::{Event, EventBusId, EventSerializer};
use crate::group::Group;
use crate::group_consumer::GroupRegistrationHandler;
use crate::key::{RegistrationKey, RoutingKey, RoutingKeyConverter};
use crate::key_consumer::KeyRegistrationHandler;
use crate::listener::{EventListener, Registration};
use crate::naming::NamingStrategy;
use crate::pubsub::PubSubStore;
use crate::registry::LocalListenerRegistry;
use crate::retry::RetryBackoff;

/// Tuning knobs of one bus instance.
#[derive(Clone, Debug)]
pub struct EventBusConfig {
    bus_name: String,
    retry_backoff: RetryBackoff,
    group_concurrency: usize,
    key_concurrency: usize,
    prefetch: usize,
    listener_timeout: Duration,
    interest_ttl: Duration,
}

impl EventBusConfig {
    pub fn new(bus_name: impl Into<String>) -> Self {
        EventBusConfig {
            bus_name: bus_name.into(),
            retry_backoff: RetryBackoff::default(),
            group_concurrency: 16,
            key_concurrency: 16,
            prefetch: 16,
            listener_timeout: Duration::from_secs(300),
            interest_ttl: Duration::from_secs(60),
        }
    }

    /// Retry policy shared by group redelivery and dispatch publishes.
    pub fn with_retry_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Size of each group's worker pool.
    pub fn with_group_concurrency(mut self, concurrency: usize) -> Self {
        self.group_concurrency = concurrency.max(1);
        self
    }

    /// Size of the key path's worker pool, separate from the group
    /// pools.
    pub fn with_key_concurrency(mut self, concurrency: usize) -> Self {
        self.key_concurrency = concurrency.max(1);
        self
    }

    /// Maximum unacknowledged deliveries per group consumer.
    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    /// Hard cap on a single listener invocation; a stuck listener is
    /// treated as failed once it elapses.
    pub fn with_listener_timeout(mut self, timeout: Duration) -> Self {
        self.listener_timeout = timeout;
        self
    }

    /// Expiry of interest-set entries; live instances refresh at half
    /// this period.
    pub fn with_interest_ttl(mut self, ttl: Duration) -> Self {
        self.interest_ttl = ttl;
        self
    }

    pub fn bus_name(&self) -> &str {
        &self.bus_name
    }
}

const STATE_CREATED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// A distributed event bus instance.
///
/// Events dispatched through any instance reach every registered group
/// exactly once per group across the fleet (at-least-once per event,
/// with retry and dead-lettering) and every live key subscriber
/// best-effort.
pub struct EventBus {
    bus_id: EventBusId,
    naming: NamingStrategy,
    state: AtomicU8,
    broker: Arc<dyn Broker>,
    registry: Arc<LocalListenerRegistry>,
    dispatcher: EventDispatcher,
    groups: Arc<GroupRegistrationHandler>,
    keys: Arc<KeyRegistrationHandler>,
}

impl EventBus {
    pub fn new(
        config: EventBusConfig,
        broker: Arc<dyn Broker>,
        pubsub: Arc<dyn PubSubStore>,
        dead_letters: Arc<dyn EventDeadLetters>,
        serializer: Arc<dyn EventSerializer>,
        converter: RoutingKeyConverter,
    ) -> Self {
        let bus_id = EventBusId::random();
        let naming = NamingStrategy::new(config.bus_name.clone());
        let registry = Arc::new(LocalListenerRegistry::new());

        let dispatcher = EventDispatcher::new(
            bus_id,
            naming.clone(),
            broker.clone(),
            pubsub.clone(),
            dead_letters.clone(),
            serializer.clone(),
            registry.clone(),
            config.retry_backoff,
            config.listener_timeout,
        );
        let groups = Arc::new(GroupRegistrationHandler::new(
            naming.clone(),
            broker.clone(),
            serializer.clone(),
            dead_letters,
            config.retry_backoff,
            config.group_concurrency,
            config.prefetch,
            config.listener_timeout,
        ));
        let keys = Arc::new(KeyRegistrationHandler::new(
            bus_id,
            naming.channel(&bus_id),
            pubsub,
            serializer,
            Arc::new(converter),
            registry.clone(),
            config.interest_ttl,
            config.listener_timeout,
            config.key_concurrency,
        ));

        EventBus {
            bus_id,
            naming,
            state: AtomicU8::new(STATE_CREATED),
            broker,
            registry,
            dispatcher,
            groups,
            keys,
        }
    }

    pub fn bus_id(&self) -> EventBusId {
        self.bus_id
    }

    /// Declare the main exchange and begin key consumption. Idempotent;
    /// a stopped bus can be started again.
    pub async fn start(&self) -> Result<(), BusError> {
        if self.state.load(Ordering::SeqCst) == STATE_RUNNING {
            return Ok(());
        }
        self.broker.declare_exchange(&self.naming.exchange()).await?;
        self.keys.start().await?;
        self.state.store(STATE_RUNNING, Ordering::SeqCst);
        info!(bus_id = %self.bus_id, bus_name = %self.naming.bus_name(), "event bus started");
        Ok(())
    }

    /// Dispose all group and key consumers and clear local bookkeeping.
    /// Idempotent. Durable topology stays in place.
    pub async fn stop(&self) {
        if self.state.swap(STATE_STOPPED, Ordering::SeqCst) == STATE_STOPPED {
            return;
        }
        self.groups.stop().await;
        self.keys.stop();
        self.registry.clear();
        info!(bus_id = %self.bus_id, "event bus stopped");
    }

    /// Recreate consumer subscriptions for both delivery paths without
    /// re-declaring topology, used after detected broker connectivity
    /// loss.
    pub async fn restart(&self) -> Result<(), BusError> {
        self.ensure_running()?;
        self.groups.restart().await?;
        self.keys.restart().await?;
        info!(bus_id = %self.bus_id, "event bus consumers restarted");
        Ok(())
    }

    /// Register a durable group listener. The group's work queue is
    /// declared on first registration anywhere in the fleet; at most one
    /// registration per group is allowed on one instance.
    pub async fn register(
        &self,
        listener: Arc<dyn EventListener>,
        group: Group,
    ) -> Result<Box<dyn Registration>, BusError> {
        self.ensure_running()?;
        let registration = self.groups.register(listener, group).await?;
        Ok(Box::new(registration))
    }

    /// Register an ephemeral key listener on this instance.
    pub async fn register_key(
        &self,
        listener: Arc<dyn EventListener>,
        key: &dyn RegistrationKey,
    ) -> Result<Box<dyn Registration>, BusError> {
        self.ensure_running()?;
        let registration = self.keys.register(listener, key).await?;
        Ok(Box::new(registration))
    }

    /// Publish an event to all registered groups and to the live
    /// subscribers of the given keys. Noop events are never dispatched.
    pub async fn dispatch(
        &self,
        event: Arc<dyn Event>,
        keys: &[Arc<dyn RegistrationKey>],
    ) -> Result<(), BusError> {
        self.ensure_running()?;
        let mut routing_keys: Vec<RoutingKey> = Vec::with_capacity(keys.len());
        for key in keys {
            let routing_key = RoutingKey::of(key.as_ref());
            if !routing_keys.contains(&routing_key) {
                routing_keys.push(routing_key);
            }
        }
        self.dispatcher.dispatch(event, routing_keys).await
    }

    /// Replay one event for one group, bypassing the normal publish
    /// path. For the synthetic dispatching-failure group this re-runs
    /// the full group broadcast instead.
    pub async fn re_deliver(&self, group: &Group, event: Arc<dyn Event>) -> Result<(), BusError> {
        self.ensure_running()?;
        if event.is_noop() {
            return Ok(());
        }
        if *group == Group::dispatching_failure(self.naming.bus_name()) {
            return self.dispatcher.broadcast_to_groups(&event).await;
        }
        self.groups.re_deliver(group, event).await
    }

    /// Groups currently registered on this instance.
    pub fn list_registered_groups(&self) -> Vec<Group> {
        self.groups.registered_groups()
    }

    fn ensure_running(&self) -> Result<(), BusError> {
        if self.state.load(Ordering::SeqCst) == STATE_RUNNING {
            Ok(())
        } else {
            Err(BusError::NotRunning)
        }
    }
}
