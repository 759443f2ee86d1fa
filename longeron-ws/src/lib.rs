//! # Longeron WebSocket transport
//!
//! RFC 6455 framed-stream transport for Longeron sockets.
//!
//! ## Layers
//!
//! - [`frame`], [`close`], [`utf8`]: wire format, close codes and the
//!   incremental text validator
//! - [`handshake`]: HTTP/1.1 upgrade with SP protocol negotiation
//! - [`session`]: sans-IO per-connection state machine
//! - [`acceptor`]: sans-IO accept-one-connection state machine
//! - [`stream`], [`listener`]: compio drivers running the two machines
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use longeron_ws::{connect, WsOptions};
//! use longeron_core::message::Message;
//!
//! #[compio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ws = connect("127.0.0.1:5555", WsOptions::new()).await?;
//!     ws.send(Message::from_slice(b"Hello")?).await?;
//!     let reply = ws.recv().await?;
//!     println!("{:?}", reply.body.as_slice());
//!     Ok(())
//! }
//! ```

// Only the socket option plumbing in `listener` opts back into unsafe code
#![cfg_attr(not(test), deny(unsafe_code))]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]

pub mod acceptor;
pub mod close;
pub mod config;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod listener;
pub mod session;
pub mod stream;
pub mod utf8;

pub use config::WsOptions;
pub use error::{Result, WsError};
pub use frame::{Opcode, Role};
pub use handshake::SpProtocol;
pub use listener::WsListener;
pub use stream::{connect, connect_monitored, spawn_session, WsPipe, WsStream};

pub mod prelude {
    pub use crate::acceptor::{Acceptor, AcceptorAction, AcceptorEvent, AcceptorStats};
    pub use crate::config::{ConnectionOptions, WsOptions};
    pub use crate::error::{Result, WsError};
    pub use crate::frame::{Opcode, Role};
    pub use crate::handshake::SpProtocol;
    pub use crate::listener::WsListener;
    pub use crate::session::{
        Session, SessionAction, SessionConfig, SessionEvent, SessionOutcome, SessionStats,
    };
    pub use crate::stream::{connect, spawn_session, WsPipe, WsStream};
}
