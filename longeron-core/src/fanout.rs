//! Pipe hooks for socket types built on the [`Distributor`].
//!
//! A transport attaches a pipe with `add`, reports it writable with
//! `writable`, and detaches it with `remove`. `Fanout` is the plain
//! broadcast socket core: every outgoing message goes to all writable pipes.

use crate::dist::{DistKey, Distributor};
use crate::message::Message;
use crate::pipe::Pipe;
use tracing::debug;

/// Hooks a socket type exposes to transports.
pub trait PipeHooks<P: Pipe> {
    /// A new connection finished its handshake.
    fn add(&mut self, pipe: P) -> DistKey;

    /// The connection is gone. Returns the pipe to its transport.
    fn remove(&mut self, key: DistKey) -> Option<P>;

    /// The pipe has an inbound message ready.
    fn readable(&mut self, key: DistKey);

    /// The pipe can accept an outbound message again.
    fn writable(&mut self, key: DistKey);
}

/// Broadcast-only socket core.
pub struct Fanout<P> {
    dist: Distributor<P>,
    readable: Vec<DistKey>,
}

impl<P> Default for Fanout<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Fanout<P> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            dist: Distributor::new(),
            readable: Vec::new(),
        }
    }

    /// Number of pipes currently writable.
    #[must_use]
    pub fn writable_count(&self) -> usize {
        self.dist.count()
    }

    /// Pipes that reported inbound data, oldest first. Cleared on read.
    pub fn take_readable(&mut self) -> Vec<DistKey> {
        std::mem::take(&mut self.readable)
    }

    #[must_use]
    pub const fn distributor(&self) -> &Distributor<P> {
        &self.dist
    }
}

impl<P: Pipe> Fanout<P> {
    /// Send to every writable pipe. Returns how many pipes took the message.
    pub fn send(&mut self, msg: Message) -> usize {
        self.dist.broadcast(msg, None)
    }

    /// Send to every writable pipe except the one identified by `origin`,
    /// the forwarding rule of bus-style sockets.
    pub fn send_except(&mut self, msg: Message, origin: DistKey) -> usize {
        self.dist.broadcast(msg, Some(origin))
    }
}

impl<P: Pipe> PipeHooks<P> for Fanout<P> {
    fn add(&mut self, pipe: P) -> DistKey {
        debug!("[Fanout] attaching {}", pipe.id());
        self.dist.add(pipe)
    }

    fn remove(&mut self, key: DistKey) -> Option<P> {
        self.readable.retain(|k| *k != key);
        let pipe = self.dist.remove(key)?;
        debug!("[Fanout] detached {}", pipe.id());
        Some(pipe)
    }

    fn readable(&mut self, key: DistKey) {
        if !self.readable.contains(&key) {
            self.readable.push(key);
        }
    }

    fn writable(&mut self, key: DistKey) {
        self.dist.mark_eligible(key);
    }
}
