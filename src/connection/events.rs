//! Connection lifecycle events and the handler registry
//!
//! Handlers are kept per [`EventKind`] in registration order. Registering
//! returns a [`Subscription`]; disposing it removes exactly that handler and
//! nothing else. Disposal is idempotent and holds only a weak reference, so it
//! is also safe after the owning manager is gone.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;

use crate::protocol::ServerMessage;

// ─────────────────────────────────────────────────────────────────
// Connection State
// ─────────────────────────────────────────────────────────────────

/// Lifecycle state of the duplex connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Never started
    #[default]
    Idle,
    /// Attempting to connect
    Connecting,
    /// Connected; messages flow
    Open,
    /// Waiting for the backoff timer before the next attempt
    Reconnecting,
    /// Intentionally stopped (or retry limit reached); needs a new `connect`
    Closed,
}

impl ConnectionState {
    /// Whether a session is live (a new `connect` would be a no-op)
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Open | ConnectionState::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Lifecycle plus backoff telemetry, emitted on every state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub state: ConnectionState,

    /// Consecutive failed attempts since the last successful open
    pub attempts: u32,

    /// Delay before the next attempt (only while reconnecting)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
}

// ─────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────

/// Event kinds handlers can register for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Open,
    Message,
    Close,
    Error,
    Status,
}

/// Events emitted by the connection manager
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Connection established
    Open,

    /// Decoded inbound message
    Message(ServerMessage),

    /// An open connection ended
    Close { reason: String },

    /// Transport fault (connect failure, socket error, timeout)
    Error { message: String },

    /// State transition with backoff telemetry
    Status(StatusUpdate),
}

impl ConnectionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ConnectionEvent::Open => EventKind::Open,
            ConnectionEvent::Message(_) => EventKind::Message,
            ConnectionEvent::Close { .. } => EventKind::Close,
            ConnectionEvent::Error { .. } => EventKind::Error,
            ConnectionEvent::Status(_) => EventKind::Status,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Handler Registry
// ─────────────────────────────────────────────────────────────────

/// Registered callback
pub type Handler = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

/// Ordered handlers per event kind
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Mutex<HashMap<EventKind, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a handler; the returned token removes it again
    pub fn register(self: &Arc<Self>, kind: EventKind, handler: Handler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().entry(kind).or_default().push((id, handler));

        Subscription {
            id,
            kind,
            registry: Arc::downgrade(self),
        }
    }

    /// Remove one handler; unknown ids are ignored
    fn remove(&self, kind: EventKind, id: u64) -> bool {
        let mut handlers = self.handlers.lock();
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(handler_id, _)| *handler_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&kind);
        }
        removed
    }

    /// Invoke every handler registered for the event's kind, in order
    ///
    /// The handler list is copied before the calls so a handler may register
    /// or dispose handlers without deadlocking.
    pub fn dispatch(&self, event: &ConnectionEvent) {
        let targets: Vec<Handler> = self
            .handlers
            .lock()
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        for handler in targets {
            handler(event);
        }
    }

    /// Number of handlers registered for `kind`
    pub fn count(&self, kind: EventKind) -> usize {
        self.handlers.lock().get(&kind).map_or(0, Vec::len)
    }
}

/// Disposer for one registered handler
#[must_use = "dropping a Subscription keeps the handler registered; call dispose() to remove it"]
pub struct Subscription {
    id: u64,
    kind: EventKind,
    registry: Weak<HandlerRegistry>,
}

impl Subscription {
    /// Remove the handler; calling again, or after the registry is gone, does nothing
    pub fn dispose(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.kind, self.id);
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Convert into a guard that disposes when dropped
    pub fn dispose_on_drop(self) -> SubscriptionGuard {
        SubscriptionGuard(self)
    }
}

/// Scoped [`Subscription`]; the handler is removed when the guard drops
#[derive(Debug)]
pub struct SubscriptionGuard(Subscription);

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.0.dispose();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
