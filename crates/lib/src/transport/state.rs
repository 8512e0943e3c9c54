//! Connection state machine and transition-event emission.

use tokio::sync::watch;

/// Lifecycle of the link. Legal moves:
/// Disconnected → Connecting → Connected → {Reconnecting ↔ Connected} → Disconnected,
/// plus Connecting → Disconnected when torn down before the first link came up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Reconnecting)
                | (Connected, Disconnected)
                | (Reconnecting, Connected)
                | (Reconnecting, Disconnected)
        )
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

/// Emitted once per state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Reconnected,
    Disconnected,
}

/// Raw observation from the link task, before deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSignal {
    /// A connect was requested.
    Opening,
    /// The socket is open.
    Up,
    /// The socket dropped; a retry will follow.
    Down,
    /// Explicit teardown; no retry.
    Closed,
}

/// Holds the process-wide `ConnectionState` for one transport and turns link signals into
/// at most one `ConnectionEvent` each. Repeated identical signals emit nothing.
pub struct ConnectionTracker {
    tx: watch::Sender<ConnectionState>,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    pub fn state(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Apply a link signal; returns the event to emit, if this signal caused a transition that has one.
    pub fn apply(&self, signal: LinkSignal) -> Option<ConnectionEvent> {
        use ConnectionState::*;
        let current = self.state();
        let (next, event) = match (current, signal) {
            (Disconnected, LinkSignal::Opening) => (Connecting, None),
            (Connecting, LinkSignal::Up) => (Connected, Some(ConnectionEvent::Connected)),
            (Reconnecting, LinkSignal::Up) => (Connected, Some(ConnectionEvent::Reconnected)),
            (Connected, LinkSignal::Down) => (Reconnecting, Some(ConnectionEvent::Disconnected)),
            (Connected, LinkSignal::Closed) => (Disconnected, Some(ConnectionEvent::Disconnected)),
            // Disconnected was already announced when the link went down.
            (Reconnecting, LinkSignal::Closed) | (Connecting, LinkSignal::Closed) => (Disconnected, None),
            _ => return None,
        };
        debug_assert!(current.can_transition_to(next));
        log::debug!("connection state {:?} -> {:?}", current, next);
        self.tx.send_replace(next);
        event
    }
}
