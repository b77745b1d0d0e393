//! Bus-level error type.

use std::fmt;

use crate::broker::BrokerError;
use crate::deadletter::DeadLetterError;
use crate::event::SerializerError;
use crate::group::Group;
use crate::key::RoutingKeyError;
use crate::pubsub::PubSubError;

/// Errors surfaced by the bus API.
#[derive(Debug)]
pub enum BusError {
    /// `register`/`dispatch`/`re_deliver` called while the bus is not
    /// running. No side effects took place.
    NotRunning,
    /// The group already has an active registration on this instance.
    GroupAlreadyRegistered(Group),
    /// `re_deliver` named a group with no registration on this instance.
    GroupNotRegistered(Group),
    /// A pub/sub channel message did not have the expected
    /// `<event><sep><busId><sep><routingKey>` shape.
    MalformedKeyMessage(String),
    Broker(BrokerError),
    PubSub(PubSubError),
    DeadLetter(DeadLetterError),
    Serializer(SerializerError),
    RoutingKey(RoutingKeyError),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::NotRunning => write!(f, "event bus is not running"),
            BusError::GroupAlreadyRegistered(group) => {
                write!(f, "group `{}` is already registered", group)
            }
            BusError::GroupNotRegistered(group) => {
                write!(f, "group `{}` is not registered", group)
            }
            BusError::MalformedKeyMessage(raw) => {
                write!(f, "malformed key channel message: `{}`", raw)
            }
            BusError::Broker(err) => write!(f, "broker error: {}", err),
            BusError::PubSub(err) => write!(f, "pub/sub error: {}", err),
            BusError::DeadLetter(err) => write!(f, "dead letter error: {}", err),
            BusError::Serializer(err) => write!(f, "serializer error: {}", err),
            BusError::RoutingKey(err) => write!(f, "routing key error: {}", err),
        }
    }
}

impl std::error::Error for BusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BusError::Broker(err) => Some(err),
            BusError::PubSub(err) => Some(err),
            BusError::DeadLetter(err) => Some(err),
            BusError::Serializer(err) => Some(err),
            BusError::RoutingKey(err) => Some(err),
            _ => None,
        }
    }
}

impl From<BrokerError> for BusError {
    fn from(err: BrokerError) -> Self {
        BusError::Broker(err)
    }
}

impl From<PubSubError> for BusError {
    fn from(err: PubSubError) -> Self {
        BusError::PubSub(err)
    }
}

impl From<DeadLetterError> for BusError {
    fn from(err: DeadLetterError) -> Self {
        BusError::DeadLetter(err)
    }
}

impl From<SerializerError> for BusError {
    fn from(err: SerializerError) -> Self {
        BusError::Serializer(err)
    }
}

impl From<RoutingKeyError> for BusError {
    fn from(err: RoutingKeyError) -> Self {
        BusError::RoutingKey(err)
    }
}
