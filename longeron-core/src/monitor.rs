//! Transport event monitoring.
//!
//! Acceptors and connection drivers report lifecycle events here. Sending is
//! best-effort: a full or dropped monitor never stalls an actor.

use std::fmt;
use std::net::SocketAddr;

/// Connection lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Listener accepted a connection from a peer.
    Accepted(SocketAddr),

    /// Accept failed; the acceptor retries.
    AcceptFailed { reason: String },

    /// Outbound connection established.
    Connected(SocketAddr),

    /// Opening handshake rejected or timed out.
    HandshakeFailed { reason: String },

    /// Session ended with a close handshake carrying `code`.
    Closed { code: u16 },

    /// Session ended because the stream broke.
    Broken,

    /// Session or acceptor fully stopped and gave its resources back.
    Stopped,
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted(addr) => write!(f, "Accepted connection from {addr}"),
            Self::AcceptFailed { reason } => write!(f, "Accept failed: {reason}"),
            Self::Connected(addr) => write!(f, "Connected to {addr}"),
            Self::HandshakeFailed { reason } => write!(f, "Handshake failed: {reason}"),
            Self::Closed { code } => write!(f, "Closed with code {code}"),
            Self::Broken => write!(f, "Connection broken"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Handle for receiving transport events.
pub type TransportMonitor = flume::Receiver<TransportEvent>;

/// Sender side, held by acceptors and connection drivers.
pub type TransportEventSender = flume::Sender<TransportEvent>;

/// Creates a new monitoring channel pair.
#[must_use]
pub fn create_monitor() -> (TransportEventSender, TransportMonitor) {
    flume::unbounded()
}

/// Emit `event` if a monitor is attached.
pub fn emit(monitor: Option<&TransportEventSender>, event: TransportEvent) {
    if let Some(tx) = monitor {
        let _ = tx.try_send(event);
    }
}
