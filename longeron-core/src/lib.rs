//! Longeron Core
//!
//! This crate contains the transport-agnostic building blocks:
//! - Refcounted, resizable message chunks (`chunk`)
//! - Three-chunk messages with ancillary records (`message`)
//! - The pipe abstraction a socket sends through (`pipe`)
//! - Fan-out distribution with in-flight pruning (`dist`)
//! - Socket-side pipe hooks and a broadcast socket core (`fanout`)
//! - Zero-copy compio write buffers (`iobuf`)
//! - Transport lifecycle events (`monitor`)
//! - Error types (`error`)

// Only `chunk` and `iobuf` opt back into unsafe code
#![cfg_attr(not(test), deny(unsafe_code))]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
pub mod chunk;
pub mod dist;
pub mod error;
pub mod fanout;
pub mod iobuf;
pub mod message;
pub mod monitor;
pub mod pipe;

// Optional: a small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::chunk::{Chunk, Shares};
    pub use crate::dist::{DistKey, Distributor};
    pub use crate::error::{CoreError, Result};
    pub use crate::fanout::{Fanout, PipeHooks};
    pub use crate::iobuf::IoBytes;
    pub use crate::message::{Message, MessageShares};
    pub use crate::monitor::{TransportEvent, TransportMonitor};
    pub use crate::pipe::{Pipe, PipeId, PipeStatus};
}
