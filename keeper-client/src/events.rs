//! # Pool Events
//!
//! Purpose: Let observers follow connection lifecycles without coupling the
//! pool to them.
//!
//! ## Design Principles
//! 1. **Observer via Channel**: Each pool owns a broadcast sender; every
//!    subscriber gets its own receiver and sees every event from then on.
//! 2. **Fire and Forget**: Emitting never blocks and never fails the pool,
//!    even with zero subscribers or a lagging one.
//! 3. **Observational Only**: Pool bookkeeping never reads events back.

use std::fmt;
use std::time::Duration;

use tokio::sync::broadcast;

/// Pool-unique identifier of a connection.
pub type ConnectionId = u64;

/// Events buffered per subscriber before the oldest are dropped.
pub const EVENT_CAPACITY: usize = 256;

/// Lifecycle notification emitted by a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// TCP session established, handshake not yet done.
    Connect(ConnectionId),
    /// Session is ready for commands.
    Ready(ConnectionId),
    /// A broken session is about to re-dial.
    Reconnecting {
        id: ConnectionId,
        attempt: u32,
        delay: Duration,
    },
    /// The session reported an error.
    Error { id: ConnectionId, message: String },
    /// The socket closed; `error` is set when it closed because of a failure.
    Close {
        id: ConnectionId,
        error: Option<String>,
    },
    /// A destroyed connection finished its graceful close.
    Disconnected(ConnectionId),
    /// The pool finished `end()`.
    End,
}

impl PoolEvent {
    /// Event name as observers know it.
    pub fn name(&self) -> &'static str {
        match self {
            PoolEvent::Connect(_) => "connect",
            PoolEvent::Ready(_) => "ready",
            PoolEvent::Reconnecting { .. } => "reconnecting",
            PoolEvent::Error { .. } => "error",
            PoolEvent::Close { .. } => "close",
            PoolEvent::Disconnected(_) => "disconnected",
            PoolEvent::End => "end",
        }
    }

    /// The affected connection, if the event concerns one.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            PoolEvent::Connect(id) | PoolEvent::Ready(id) | PoolEvent::Disconnected(id) => Some(*id),
            PoolEvent::Reconnecting { id, .. }
            | PoolEvent::Error { id, .. }
            | PoolEvent::Close { id, .. } => Some(*id),
            PoolEvent::End => None,
        }
    }
}

impl fmt::Display for PoolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.connection_id() {
            Some(id) => write!(f, "{} (connection {})", self.name(), id),
            None => f.write_str(self.name()),
        }
    }
}

/// Sending half shared by a pool and all of its connections.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: broadcast::Sender<PoolEvent>,
}

impl EventSink {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        EventSink { sender }
    }

    /// Publishes an event to current subscribers.
    pub fn emit(&self, event: PoolEvent) {
        tracing::trace!(event = %event, "pool event");
        // No subscribers is the common case.
        let _ = self.sender.send(event);
    }

    /// Registers a new observer.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}
