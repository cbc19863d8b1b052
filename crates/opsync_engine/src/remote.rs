//! Interface to the remote replica.
//!
//! The reconciler talks to the remote through [`RemoteStore`], which
//! mirrors the bus surface: queries for the pull phase, commands for the
//! push phase. Transport failures carry a retryability flag so the
//! reconciler knows whether backing off can help.

use crate::bus::MessageBus;
use crate::error::{EngineError, EngineResult};
use opsync_protocol::{Command, Event, Query, QueryResponse};
use std::sync::Arc;

/// A remote replica reachable over some transport.
pub trait RemoteStore: Send + Sync {
    /// Sends a query and waits for its response.
    fn ask(&self, query: &Query) -> EngineResult<QueryResponse>;

    /// Sends a command and waits for the event acknowledging it.
    fn dispatch(&self, command: &Command) -> EngineResult<Event>;
}

/// A remote backed by another node's bus in the same process.
///
/// Used in tests and for embedded deployments where the "remote" is a
/// second engine instance.
pub struct InMemoryRemote {
    bus: Arc<MessageBus>,
}

impl InMemoryRemote {
    /// Wraps the bus of the peer node.
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus }
    }
}

impl RemoteStore for InMemoryRemote {
    fn ask(&self, query: &Query) -> EngineResult<QueryResponse> {
        self.bus.ask(query)
    }

    fn dispatch(&self, command: &Command) -> EngineResult<Event> {
        let outcome = self.bus.dispatch(command)?;
        outcome
            .event()
            .cloned()
            .ok_or_else(|| EngineError::unexpected_response("command produced no event"))
    }
}

impl std::fmt::Debug for InMemoryRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryRemote").finish_non_exhaustive()
    }
}
