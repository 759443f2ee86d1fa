/// WebSocket transport error types.

use crate::handshake::HandshakeError;
use longeron_core::error::CoreError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the WebSocket transport
#[derive(Error, Debug)]
pub enum WsError {
    /// IO error on the underlying stream
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Chunk allocation or pipe failure
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Opening handshake rejected
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// Opening handshake did not finish in time
    #[error("Handshake timeout after {0:?}")]
    HandshakeTimeout(Duration),

    /// Session is not in the active state
    #[error("Session not active")]
    NotActive,

    /// A send is already in flight
    #[error("Send already in progress")]
    SendInProgress,

    /// No received message is waiting
    #[error("No message ready")]
    NoMessage,

    /// Connection closed (close handshake or broken stream)
    #[error("Connection closed")]
    Closed,

    /// Connection failed by a protocol violation
    #[error("Protocol error {code}: {reason}")]
    Protocol { code: u16, reason: &'static str },
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, WsError>;

impl WsError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            Self::Core(e) => e.is_recoverable(),
            Self::SendInProgress | Self::NoMessage => true,
            _ => false,
        }
    }

    /// Check if this is a connection error
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Closed | Self::Protocol { .. } | Self::Handshake(_) | Self::HandshakeTimeout(_)
        )
    }
}
