//! Pipe abstraction: one connected peer's send path as seen by a socket.

use crate::message::Message;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_PIPE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique pipe identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipeId(u64);

impl PipeId {
    /// Allocate a fresh identity.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_PIPE_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe#{}", self.0)
    }
}

/// Outcome of handing a message to a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeStatus {
    /// Message taken; the pipe can accept more.
    Ready,
    /// Message taken (or dropped because the peer is gone); the pipe stops
    /// being writable until its owner marks it eligible again.
    Release,
}

/// Per-connection capability a socket sends through.
pub trait Pipe {
    /// Stable identity of this pipe.
    fn id(&self) -> PipeId;

    /// Hand over one message. Never blocks.
    fn send(&mut self, msg: Message) -> PipeStatus;
}

impl<P: Pipe + ?Sized> Pipe for Box<P> {
    fn id(&self) -> PipeId {
        (**self).id()
    }

    fn send(&mut self, msg: Message) -> PipeStatus {
        (**self).send(msg)
    }
}
