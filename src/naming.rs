//! Broker-level names derived from the logical bus name.

use crate::event::EventBusId;
use crate::group::Group;

/// Pure mapping from a logical bus name to the names of exchanges,
/// queues and pub/sub channels. Holds no state beyond the bus name, so
/// every instance of a fleet derives the same topology.
#[derive(Clone, Debug)]
pub struct NamingStrategy {
    bus_name: String,
}

impl NamingStrategy {
    pub fn new(bus_name: impl Into<String>) -> Self {
        NamingStrategy {
            bus_name: bus_name.into(),
        }
    }

    pub fn bus_name(&self) -> &str {
        &self.bus_name
    }

    /// The main exchange all group work queues bind to.
    pub fn exchange(&self) -> String {
        format!("{}-exchange", self.bus_name)
    }

    /// The durable work queue shared by all instances of a group.
    pub fn group_queue(&self, group: &Group) -> String {
        format!("{}-workQueue-{}", self.bus_name, group.name())
    }

    /// The per-group retry exchange, bound back to the group's queue.
    pub fn retry_exchange(&self, group: &Group) -> String {
        format!("{}-retryExchange-{}", self.bus_name, group.name())
    }

    /// The pub/sub channel of one live bus instance.
    pub fn channel(&self, bus_id: &EventBusId) -> String {
        format!("{}-channel-{}", self.bus_name, bus_id)
    }
}
