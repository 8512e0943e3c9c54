//! Transport connection: one logical link to the backend.
//!
//! The transport owns `ConnectionState` and is the only writer of it. Everything the link
//! produces (connection transitions and realtime notifications) is delivered, in arrival
//! order, on a single `TransportEvent` channel consumed by the session controller.

mod backoff;
mod state;
mod ws;

use crate::backend::Notification;
use std::time::Duration;

pub use backoff::Backoff;
pub use state::{ConnectionEvent, ConnectionState, ConnectionTracker, LinkSignal};
pub use ws::WsTransport;

/// Transport-level failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("not connected")]
    NotConnected,
    #[error("connection lost")]
    Lost,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport closed")]
    Closed,
}

/// Everything the transport pushes to its consumer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connection(ConnectionEvent),
    Notification(Notification),
}
