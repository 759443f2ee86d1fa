//! # Longeron
//!
//! Broker-less messaging over WebSocket framed streams, built on `io_uring`.
//!
//! ## Architecture
//!
//! Longeron is structured as a **messaging kernel** with a transport on top:
//!
//! - **`longeron-core`**: refcounted chunks, messages, pipes and the fan-out
//!   distributor
//! - **`longeron-ws`**: RFC 6455 transport; the session and acceptor are pure
//!   state machines (sans-IO) driven by compio tasks
//! - **`longeron`**: Public API surface (this crate)
//!
//! ## Transports (opt-in via features)
//!
//! - **`ws`** - WebSocket framed streams (enabled by default)
//!
//! ## Quick Start
//!
//! ### Echo server
//!
//! ```rust,no_run
//! # #[cfg(feature = "ws")]
//! use longeron::prelude::*;
//!
//! # #[cfg(feature = "ws")]
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut listener = WsListener::bind("127.0.0.1:5555", WsOptions::new()).await?;
//! let ws = listener.accept().await?;
//! while let Ok(msg) = ws.recv().await {
//!     ws.send(msg).await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Broadcasting to every peer
//!
//! ```rust,no_run
//! # #[cfg(feature = "ws")]
//! use longeron::prelude::*;
//!
//! # #[cfg(feature = "ws")]
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut listener = WsListener::bind("127.0.0.1:5555", WsOptions::new()).await?;
//! let mut fanout = Fanout::new();
//! let ws = listener.accept().await?;
//! let key = fanout.add(ws.pipe());
//! fanout.writable(key);
//!
//! // One shared copy per peer, no byte copies.
//! fanout.send(Message::from_slice(b"tick")?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Safety
//!
//! - `unsafe` code is isolated to `longeron-core`'s `chunk` and `iobuf`
//!   modules and the socket option plumbing of the listener
//! - Session, acceptor and distributor logic is 100% safe Rust

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dev_tracing;

// Re-export core types
pub use bytes::Bytes;
pub use longeron_core::chunk::Chunk;
pub use longeron_core::dist::{DistKey, Distributor};
pub use longeron_core::error::CoreError;
pub use longeron_core::fanout::{Fanout, PipeHooks};
pub use longeron_core::message::{self, Message};
pub use longeron_core::monitor::{TransportEvent, TransportMonitor};
pub use longeron_core::pipe::{Pipe, PipeId, PipeStatus};

/// WebSocket framed-stream transport.
///
/// Lower layers (frame codec, sans-IO session and acceptor) are reachable
/// through the `longeron_ws` modules re-exported here.
#[cfg(feature = "ws")]
pub mod ws {
    pub use longeron_ws::{
        acceptor, close, config, frame, handshake, session, stream, utf8,
    };
    pub use longeron_ws::{
        connect, connect_monitored, spawn_session, Opcode, Role, SpProtocol, WsError,
        WsListener, WsOptions, WsPipe, WsStream,
    };
}

/// Convenient imports.
///
/// # Example
///
/// ```rust
/// use longeron::prelude::*;
///
/// // Now you have:
/// // - Message, Chunk, Pipe, Distributor, Fanout
/// // - WsListener, WsStream, WsOptions, connect (with the `ws` feature)
/// ```
pub mod prelude {
    pub use bytes::Bytes;
    pub use longeron_core::chunk::Chunk;
    pub use longeron_core::dist::Distributor;
    pub use longeron_core::fanout::{Fanout, PipeHooks};
    pub use longeron_core::message::{kind, Message};
    pub use longeron_core::pipe::{Pipe, PipeStatus};

    #[cfg(feature = "ws")]
    pub use crate::ws::{connect, Opcode, WsError, WsListener, WsOptions, WsStream};
}
