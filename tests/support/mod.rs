//! Shared fixtures for the event bus integration tests.

#![allow(dead_code)]

use std::any::Any;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use groupcast::{
    Event, EventBus, EventBusConfig, EventId, EventListener, ExecutionMode, InMemoryBroker,
    InMemoryDeadLetters, InMemoryPubSub, JsonEventSerializer, ListenerError, RegistrationKey,
    RegistrationKeyFactory, RetryBackoff, RoutingKeyConverter, RoutingKeyError,
};

/// Event type carried by all integration tests.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestEvent {
    pub id: EventId,
    pub username: String,
    pub noop: bool,
    pub body: Value,
}

impl TestEvent {
    pub fn new(body: Value) -> Self {
        TestEvent {
            id: EventId::random(),
            username: "tester".to_string(),
            noop: false,
            body,
        }
    }

    pub fn noop() -> Self {
        TestEvent {
            id: EventId::random(),
            username: "tester".to_string(),
            noop: true,
            body: Value::Null,
        }
    }
}

impl Event for TestEvent {
    fn event_id(&self) -> EventId {
        self.id
    }

    fn username(&self) -> &str {
        &self.username
    }

    fn is_noop(&self) -> bool {
        self.noop
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn event(body: Value) -> Arc<TestEvent> {
    Arc::new(TestEvent::new(body))
}

/// The key kind used across the tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailboxKey(pub String);

impl MailboxKey {
    pub fn arc(value: impl Into<String>) -> Arc<dyn RegistrationKey> {
        Arc::new(MailboxKey(value.into()))
    }
}

impl RegistrationKey for MailboxKey {
    fn key_kind(&self) -> &'static str {
        "MailboxKey"
    }

    fn key_value(&self) -> String {
        self.0.clone()
    }
}

pub struct MailboxKeyFactory;

impl RegistrationKeyFactory for MailboxKeyFactory {
    fn key_kind(&self) -> &'static str {
        "MailboxKey"
    }

    fn from_value(&self, value: &str) -> Result<Arc<dyn RegistrationKey>, RoutingKeyError> {
        Ok(Arc::new(MailboxKey(value.to_string())))
    }
}

/// Counts invocations; optionally fails the first N of them.
pub struct CountingListener {
    mode: ExecutionMode,
    failures_remaining: AtomicU32,
    invocations: AtomicUsize,
    received: Mutex<Vec<EventId>>,
}

impl CountingListener {
    pub fn synchronous() -> Arc<Self> {
        Arc::new(Self::with_mode(ExecutionMode::Synchronous, 0))
    }

    pub fn asynchronous() -> Arc<Self> {
        Arc::new(Self::with_mode(ExecutionMode::Asynchronous, 0))
    }

    /// A listener whose first `failures` invocations return an error.
    pub fn failing(failures: u32) -> Arc<Self> {
        Arc::new(Self::with_mode(ExecutionMode::Asynchronous, failures))
    }

    fn with_mode(mode: ExecutionMode, failures: u32) -> Self {
        CountingListener {
            mode,
            failures_remaining: AtomicU32::new(failures),
            invocations: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<EventId> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventListener for CountingListener {
    fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    async fn event(&self, event: Arc<dyn Event>) -> Result<(), ListenerError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.received.lock().unwrap().push(event.event_id());
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err("induced listener failure".into());
        }
        Ok(())
    }
}

/// Holds every invocation for a fixed duration before succeeding.
pub struct SleepingListener {
    delay: Duration,
    invocations: AtomicUsize,
}

impl SleepingListener {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(SleepingListener {
            delay,
            invocations: AtomicUsize::new(0),
        })
    }

    pub fn count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventListener for SleepingListener {
    async fn event(&self, _event: Arc<dyn Event>) -> Result<(), ListenerError> {
        tokio::time::sleep(self.delay).await;
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// The collaborators one simulated fleet shares.
#[derive(Clone, Default)]
pub struct TestInfra {
    pub broker: InMemoryBroker,
    pub pubsub: InMemoryPubSub,
    pub dead_letters: InMemoryDeadLetters,
}

impl TestInfra {
    pub fn new() -> Self {
        Self::default()
    }
}

pub const BUS_NAME: &str = "testBus";

/// Fast-retry backoff so failure tests finish quickly.
pub fn fast_backoff(max_retries: u32) -> RetryBackoff {
    RetryBackoff::new()
        .with_max_retries(max_retries)
        .with_first_backoff(Duration::from_millis(5))
        .with_jitter_factor(0.0)
}

pub fn test_bus(infra: &TestInfra) -> EventBus {
    test_bus_with(infra, fast_backoff(3))
}

pub fn test_bus_with(infra: &TestInfra, backoff: RetryBackoff) -> EventBus {
    EventBus::new(
        EventBusConfig::new(BUS_NAME)
            .with_retry_backoff(backoff)
            .with_group_concurrency(4)
            .with_prefetch(4)
            .with_listener_timeout(Duration::from_secs(5)),
        Arc::new(infra.broker.clone()),
        Arc::new(infra.pubsub.clone()),
        Arc::new(infra.dead_letters.clone()),
        Arc::new(JsonEventSerializer::<TestEvent>::new()),
        RoutingKeyConverter::new(vec![Box::new(MailboxKeyFactory)]),
    )
}

/// Poll a condition until it holds or the deadline passes.
pub async fn wait_until(condition: impl Fn() -> bool, deadline: Duration) -> bool {
    let started = std::time::Instant::now();
    while started.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
