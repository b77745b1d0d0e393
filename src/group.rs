//! Durable listener groups.

use std::fmt;

/// A named, durable listener category.
///
/// Every bus instance registering the same group competes on one shared
/// work queue, so each event is processed exactly once per group across
/// the fleet. Identity is the name alone.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Group {
    name: String,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Group { name: name.into() }
    }

    /// The synthetic per-bus group holding events that could not be
    /// broadcast to groups at all (broker unavailable past the publish
    /// retry budget). Redelivering from it re-runs the group broadcast.
    pub fn dispatching_failure(bus_name: &str) -> Self {
        Group {
            name: format!("{}-dispatchingFailure", bus_name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_the_name() {
        assert_eq!(Group::new("indexer"), Group::new("indexer"));
        assert_ne!(Group::new("indexer"), Group::new("quota"));
    }

    #[test]
    fn dispatching_failure_is_scoped_to_the_bus_name() {
        let group = Group::dispatching_failure("mailEvents");
        assert_eq!(group.name(), "mailEvents-dispatchingFailure");
        assert_ne!(group, Group::dispatching_failure("otherBus"));
    }
}
