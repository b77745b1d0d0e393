//! Registration keys and their wire form.
//!
//! A [`RegistrationKey`] is a typed addressing token ("notify me about
//! resource X"). On the wire it travels as a [`RoutingKey`] string of the
//! form `<kind>:<value>`. Each key kind owns a
//! [`RegistrationKeyFactory`] that parses its value part back into the
//! typed form; the [`RoutingKeyConverter`] holds the factory set.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Separates the key kind from the key value in the wire form.
pub const ROUTING_KEY_SEPARATOR: char = ':';

/// A typed, ephemeral addressing token for best-effort pub/sub fan-out.
///
/// Equality is structural: two keys are the same when kind and value
/// match.
pub trait RegistrationKey: fmt::Debug + Send + Sync {
    /// Stable name of this key kind, registered with a factory of the
    /// same name. Must not contain [`ROUTING_KEY_SEPARATOR`].
    fn key_kind(&self) -> &'static str;

    fn key_value(&self) -> String;
}

/// The wire string form of a registration key: `<kind>:<value>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingKey(String);

impl RoutingKey {
    pub fn of(key: &dyn RegistrationKey) -> Self {
        RoutingKey(format!(
            "{}{}{}",
            key.key_kind(),
            ROUTING_KEY_SEPARATOR,
            key.key_value()
        ))
    }

    /// Wrap a wire string received from another instance. Validation
    /// happens in [`RoutingKeyConverter::to_registration_key`].
    pub fn from_wire(value: impl Into<String>) -> Self {
        RoutingKey(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn split(&self) -> Result<(&str, &str), RoutingKeyError> {
        self.0
            .split_once(ROUTING_KEY_SEPARATOR)
            .ok_or_else(|| RoutingKeyError::MissingSeparator(self.0.clone()))
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Routing key parse failures are configuration or programming errors
/// (a key kind without a factory), never recovered from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingKeyError {
    MissingSeparator(String),
    UnknownKeyKind(String),
    InvalidKeyValue { kind: String, reason: String },
}

impl fmt::Display for RoutingKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingKeyError::MissingSeparator(raw) => {
                write!(f, "routing key `{}` has no kind separator", raw)
            }
            RoutingKeyError::UnknownKeyKind(kind) => {
                write!(f, "no registered factory for key kind `{}`", kind)
            }
            RoutingKeyError::InvalidKeyValue { kind, reason } => {
                write!(f, "invalid value for key kind `{}`: {}", kind, reason)
            }
        }
    }
}

impl std::error::Error for RoutingKeyError {}

/// Parses the value part of one key kind back into its typed form.
pub trait RegistrationKeyFactory: Send + Sync {
    fn key_kind(&self) -> &'static str;

    fn from_value(&self, value: &str) -> Result<Arc<dyn RegistrationKey>, RoutingKeyError>;
}

/// Bidirectional mapping between typed keys and routing-key strings.
pub struct RoutingKeyConverter {
    factories: HashMap<&'static str, Box<dyn RegistrationKeyFactory>>,
}

impl RoutingKeyConverter {
    pub fn new(factories: Vec<Box<dyn RegistrationKeyFactory>>) -> Self {
        RoutingKeyConverter {
            factories: factories
                .into_iter()
                .map(|factory| (factory.key_kind(), factory))
                .collect(),
        }
    }

    pub fn to_registration_key(
        &self,
        routing_key: &RoutingKey,
    ) -> Result<Arc<dyn RegistrationKey>, RoutingKeyError> {
        let (kind, value) = routing_key.split()?;
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| RoutingKeyError::UnknownKeyKind(kind.to_string()))?;
        factory.from_value(value)
    }
}
