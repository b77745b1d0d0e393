//! groupcast: a distributed event bus.
//!
//! Independent server instances publish domain events that are consumed
//! two ways at once:
//!
//! - **Durable groups**: named listener categories sharing one durable
//!   work queue per group. Each event is processed at least once and
//!   exactly once per group across the whole fleet, with bounded
//!   retry-with-backoff and dead-letter escalation.
//! - **Ephemeral keys**: runtime-registered, typed addressing tokens
//!   ("notify me about resource X") fanned out best-effort through a
//!   pub/sub store to the instances currently interested. Synchronous
//!   key listeners run inline on the publishing node; asynchronous ones
//!   run from the echo path only.
//!
//! The broker, the pub/sub store and the dead-letter store are
//! collaborators behind traits; in-memory implementations ship with the
//! crate for tests and single-process deployments.
//!
//! ```ignore
//! let bus = EventBus::new(
//!     EventBusConfig::new("mailEvents"),
//!     broker,
//!     pubsub,
//!     dead_letters,
//!     serializer,
//!     RoutingKeyConverter::new(vec![Box::new(MailboxKeyFactory)]),
//! );
//! bus.start().await?;
//!
//! let registration = bus.register(indexer_listener, Group::new("indexer")).await?;
//! bus.dispatch(event, &[Arc::new(MailboxKey::new("mailbox-42"))]).await?;
//! ```

mod broker;
mod bus;
mod deadletter;
mod dispatcher;
mod error;
mod event;
mod group;
mod group_consumer;
mod key;
mod key_consumer;
mod listener;
mod naming;
mod pubsub;
mod registry;
mod retry;

pub use broker::{
    Broker, BrokerError, BrokerMessage, Consumer, Delivery, InMemoryBroker,
    ORIGIN_BUS_ID_HEADER, RETRY_COUNT_HEADER,
};
pub use bus::{EventBus, EventBusConfig};
pub use deadletter::{DeadLetterError, EventDeadLetters, InMemoryDeadLetters};
pub use error::BusError;
pub use event::{
    Event, EventBusId, EventId, EventSerializer, JsonEventSerializer, SerializerError,
};
pub use group::Group;
pub use group_consumer::GroupRegistration;
pub use key::{
    RegistrationKey, RegistrationKeyFactory, RoutingKey, RoutingKeyConverter, RoutingKeyError,
    ROUTING_KEY_SEPARATOR,
};
pub use key_consumer::KeyRegistration;
pub use listener::{EventListener, ExecutionMode, ListenerError, Registration};
pub use naming::NamingStrategy;
pub use pubsub::{
    InMemoryPubSub, PubSubError, PubSubStore, PubSubSubscription, MESSAGE_PART_SEPARATOR,
};
pub use registry::{ListenerAdded, ListenerRemoved, LocalListenerRegistry};
pub use retry::{RetryBackoff, WaitDelayGenerator};
