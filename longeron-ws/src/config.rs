//! Transport configuration and defaults
//!
//! Compile-time defaults plus the runtime [`WsOptions`] builder shared by
//! connecting and accepting endpoints.

use crate::frame::Opcode;
use crate::handshake::SpProtocol;
use std::time::Duration;

/// Default cumulative receive limit per message (1 MiB).
pub const DEFAULT_RECV_MAX_SIZE: usize = 1024 * 1024;

/// Default kernel send buffer (128 KiB).
pub const DEFAULT_SEND_BUFFER: usize = 128 * 1024;

/// Default kernel receive buffer (128 KiB).
pub const DEFAULT_RECV_BUFFER: usize = 128 * 1024;

/// Opening handshake deadline.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Largest opening handshake request or response accepted.
pub const MAX_OPENING_HANDSHAKE: usize = 4096;

/// Messages queued towards a session before its pipe reports release.
pub const DEFAULT_PIPE_CAPACITY: usize = 64;

/// Options applied to every connection of an endpoint.
#[derive(Debug, Clone)]
pub struct WsOptions {
    /// Cumulative size limit for one received message. `None` = unlimited.
    pub recv_max_size: Option<usize>,
    /// Opcode used for outgoing messages without an explicit one.
    pub msg_type: Opcode,
    /// Request target sent by clients.
    pub resource: String,
    /// Host header sent by clients; the peer address when unset.
    pub host: Option<String>,
    /// Scalability protocol of the local socket.
    pub protocol: SpProtocol,
    /// Opening handshake deadline. `None` = wait forever.
    pub handshake_timeout: Option<Duration>,
    /// SO_SNDBUF for accepted and connected streams.
    pub send_buffer: usize,
    /// SO_RCVBUF for accepted and connected streams.
    pub recv_buffer: usize,
    /// Disable Nagle's algorithm.
    pub tcp_nodelay: bool,
    /// Outbound queue depth per connection.
    pub pipe_capacity: usize,
}

impl Default for WsOptions {
    fn default() -> Self {
        Self {
            recv_max_size: Some(DEFAULT_RECV_MAX_SIZE),
            msg_type: Opcode::Binary,
            resource: "/".to_string(),
            host: None,
            protocol: SpProtocol::Pair,
            handshake_timeout: Some(HANDSHAKE_TIMEOUT),
            send_buffer: DEFAULT_SEND_BUFFER,
            recv_buffer: DEFAULT_RECV_BUFFER,
            tcp_nodelay: true,
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
        }
    }
}

impl WsOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_recv_max_size(mut self, limit: Option<usize>) -> Self {
        self.recv_max_size = limit;
        self
    }

    /// Outgoing message type. Only `Text` and `Binary` make sense here.
    ///
    /// # Panics
    ///
    /// Panics for any other opcode.
    #[must_use]
    pub fn with_msg_type(mut self, msg_type: Opcode) -> Self {
        assert!(
            matches!(msg_type, Opcode::Text | Opcode::Binary),
            "message type must be TEXT or BINARY"
        );
        self.msg_type = msg_type;
        self
    }

    #[must_use]
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    #[must_use]
    pub const fn with_protocol(mut self, protocol: SpProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_send_buffer(mut self, bytes: usize) -> Self {
        self.send_buffer = bytes;
        self
    }

    #[must_use]
    pub const fn with_recv_buffer(mut self, bytes: usize) -> Self {
        self.recv_buffer = bytes;
        self
    }

    #[must_use]
    pub const fn with_tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_pipe_capacity(mut self, capacity: usize) -> Self {
        assert!(capacity > 0, "pipe capacity must be at least 1");
        self.pipe_capacity = capacity;
        self
    }

    /// Socket options handed to each accepted or connected stream.
    #[must_use]
    pub const fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            send_buffer: self.send_buffer,
            recv_buffer: self.recv_buffer,
            tcp_nodelay: self.tcp_nodelay,
        }
    }
}

/// Kernel-level options inherited by a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub send_buffer: usize,
    pub recv_buffer: usize,
    pub tcp_nodelay: bool,
}
