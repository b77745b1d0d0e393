//! Listener traits and registration handles.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BusError;
use crate::event::Event;

/// How a key-registered listener is executed relative to `dispatch`.
///
/// - `Synchronous`: runs inline on the publishing node before `dispatch`
///   resolves, and is skipped when the origin's own pub/sub channel echoes
///   the event back.
/// - `Asynchronous`: never runs inline; delivered only via the pub/sub
///   echo path, decoupled from the publishing call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    Synchronous,
    Asynchronous,
}

/// Boxed error returned by listener invocations.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// A consumer of events, registered against a group or a key.
#[async_trait]
pub trait EventListener: Send + Sync {
    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Asynchronous
    }

    async fn event(&self, event: Arc<dyn Event>) -> Result<(), ListenerError>;
}

/// Opaque handle returned by `register`.
///
/// `unregister` is idempotent; calling it twice is a no-op the second
/// time. For key registrations it also withdraws this instance's interest
/// once no local listener remains for the key.
#[async_trait]
pub trait Registration: Send + Sync {
    async fn unregister(&self) -> Result<(), BusError>;
}
