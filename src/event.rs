//! Events and their serialization boundary.
//!
//! An [`Event`] is an immutable domain fact. The bus never inspects its
//! payload; it only needs an identifier, the producing user and the
//! noop flag. Converting events to and from their wire form is the job
//! of an [`EventSerializer`] collaborator, so the bus stays agnostic of
//! payload formats.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of a single event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
    /// Generate a fresh random identifier.
    pub fn random() -> Self {
        EventId(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        EventId(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier unique to one running bus instance.
///
/// Tags every group-durable message with its origin and names that
/// instance's ephemeral pub/sub channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventBusId(Uuid);

impl EventBusId {
    /// Generate the identifier for a new bus instance.
    pub fn random() -> Self {
        EventBusId(Uuid::new_v4())
    }

    /// Parse the textual form produced by `Display`.
    pub fn parse(value: &str) -> Result<Self, SerializerError> {
        Uuid::parse_str(value)
            .map(EventBusId)
            .map_err(|err| SerializerError::Decode(format!("invalid bus id `{value}`: {err}")))
    }
}

impl fmt::Display for EventBusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An immutable domain fact published on the bus.
///
/// Noop events (`is_noop() == true`) are never dispatched; they exist so
/// producers can emit "nothing happened" placeholders without special
/// casing at every call site.
pub trait Event: fmt::Debug + Send + Sync + 'static {
    fn event_id(&self) -> EventId;

    /// The user or tenant this event was produced for.
    fn username(&self) -> &str;

    fn is_noop(&self) -> bool {
        false
    }

    /// Access to the concrete type, used by serializers.
    fn as_any(&self) -> &dyn Any;
}

/// Error type for event (de)serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerializerError {
    Encode(String),
    Decode(String),
}

impl fmt::Display for SerializerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializerError::Encode(msg) => write!(f, "event encoding failed: {}", msg),
            SerializerError::Decode(msg) => write!(f, "event decoding failed: {}", msg),
        }
    }
}

impl std::error::Error for SerializerError {}

/// Converts events to and from their wire form.
///
/// A round trip must preserve event identity and payload. The bus
/// serializes each dispatched event exactly once and reuses the result
/// for both the group and the key broadcast.
pub trait EventSerializer: Send + Sync {
    fn to_bytes(&self, event: &dyn Event) -> Result<Vec<u8>, SerializerError>;

    /// JSON form, used on the pub/sub channel wire.
    fn to_json(&self, event: &dyn Event) -> Result<String, SerializerError>;

    fn from_bytes(&self, bytes: &[u8]) -> Result<Arc<dyn Event>, SerializerError>;
}

/// serde_json-backed serializer for a single concrete event type.
///
/// Suitable for buses carrying one event enum; systems with several
/// unrelated event types supply their own [`EventSerializer`].
pub struct JsonEventSerializer<E> {
    _event: PhantomData<fn() -> E>,
}

impl<E> JsonEventSerializer<E> {
    pub fn new() -> Self {
        JsonEventSerializer {
            _event: PhantomData,
        }
    }
}

impl<E> Default for JsonEventSerializer<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventSerializer for JsonEventSerializer<E>
where
    E: Event + Serialize + DeserializeOwned,
{
    fn to_bytes(&self, event: &dyn Event) -> Result<Vec<u8>, SerializerError> {
        let event = self.downcast(event)?;
        serde_json::to_vec(event).map_err(|err| SerializerError::Encode(err.to_string()))
    }

    fn to_json(&self, event: &dyn Event) -> Result<String, SerializerError> {
        let event = self.downcast(event)?;
        serde_json::to_string(event).map_err(|err| SerializerError::Encode(err.to_string()))
    }

    fn from_bytes(&self, bytes: &[u8]) -> Result<Arc<dyn Event>, SerializerError> {
        let event: E = serde_json::from_slice(bytes)
            .map_err(|err| SerializerError::Decode(err.to_string()))?;
        Ok(Arc::new(event))
    }
}

impl<E: Event> JsonEventSerializer<E> {
    fn downcast<'a>(&self, event: &'a dyn Event) -> Result<&'a E, SerializerError> {
        event.as_any().downcast_ref::<E>().ok_or_else(|| {
            SerializerError::Encode(format!(
                "event {} does not match this serializer's event type",
                event.event_id()
            ))
        })
    }
}
