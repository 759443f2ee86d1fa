//! Fan-out distribution.
//!
//! The [`Distributor`] hands one shared copy of a message to every eligible
//! pipe. Copies are refcount bumps on the message chunks, never byte copies.
//!
//! It belongs to a single socket actor and takes `&mut self` everywhere, so
//! no locking is involved.

use crate::message::Message;
use crate::pipe::{Pipe, PipeStatus};
use tracing::trace;

/// Handle to a membership record. Stale keys (after `remove`) never alias a
/// newer record in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DistKey {
    index: u32,
    generation: u32,
}

struct Record<P> {
    pipe: P,
    linked: bool,
}

struct Slot<P> {
    generation: u32,
    record: Option<Record<P>>,
}

/// Broadcast list of pipes.
///
/// Invariant: `count()` equals the number of linked records, and the linked
/// order is the order in which records were marked eligible.
pub struct Distributor<P> {
    slots: Vec<Slot<P>>,
    free: Vec<u32>,
    linked: Vec<DistKey>,
}

impl<P> Default for Distributor<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Distributor<P> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            linked: Vec::new(),
        }
    }

    /// Number of eligible (linked) pipes.
    #[must_use]
    pub fn count(&self) -> usize {
        self.linked.len()
    }

    /// Number of attached pipes, eligible or not.
    #[must_use]
    pub fn attached(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    fn record(&self, key: DistKey) -> Option<&Record<P>> {
        let slot = self.slots.get(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.record.as_ref()
    }

    fn record_mut(&mut self, key: DistKey) -> Option<&mut Record<P>> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.record.as_mut()
    }

    /// Attach a pipe. The record is not eligible until [`mark_eligible`](Self::mark_eligible).
    pub fn add(&mut self, pipe: P) -> DistKey {
        let record = Record {
            pipe,
            linked: false,
        };
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.record = Some(record);
            return DistKey {
                index,
                generation: slot.generation,
            };
        }
        assert!(self.slots.len() < u32::MAX as usize, "distributor slot space exhausted");
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            record: Some(record),
        });
        DistKey {
            index,
            generation: 0,
        }
    }

    /// Link the record at the end of the broadcast order.
    ///
    /// Returns `false` for unknown keys. Marking an already linked record is a
    /// no-op.
    pub fn mark_eligible(&mut self, key: DistKey) -> bool {
        let Some(record) = self.record_mut(key) else {
            return false;
        };
        if !record.linked {
            record.linked = true;
            self.linked.push(key);
        }
        true
    }

    /// Detach a pipe, unlinking it first if needed, and give it back.
    pub fn remove(&mut self, key: DistKey) -> Option<P> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let record = slot.record.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        if record.linked {
            self.linked.retain(|k| *k != key);
        }
        Some(record.pipe)
    }

    #[must_use]
    pub fn is_eligible(&self, key: DistKey) -> bool {
        self.record(key).is_some_and(|r| r.linked)
    }

    #[must_use]
    pub fn pipe(&self, key: DistKey) -> Option<&P> {
        self.record(key).map(|r| &r.pipe)
    }

    pub fn pipe_mut(&mut self, key: DistKey) -> Option<&mut P> {
        self.record_mut(key).map(|r| &mut r.pipe)
    }
}

impl<P: Pipe> Distributor<P> {
    /// Send one share of `msg` to every eligible pipe except `exclude`.
    ///
    /// With no eligible pipes the message is released. A pipe answering
    /// [`PipeStatus::Release`] is unlinked on the spot. Returns the number of
    /// pipes the message was handed to.
    pub fn broadcast(&mut self, msg: Message, exclude: Option<DistKey>) -> usize {
        if self.linked.is_empty() {
            trace!("[Distributor] no eligible pipes, dropping {} bytes", msg.len());
            return 0;
        }

        let mut shares = msg.share(self.linked.len());
        let mut delivered = 0;
        let mut i = 0;

        while i < self.linked.len() {
            let key = self.linked[i];
            let Some(copy) = shares.next() else {
                break;
            };

            if exclude == Some(key) {
                drop(copy);
                i += 1;
                continue;
            }

            let Some(record) = self.record_mut(key) else {
                unreachable!("linked key without a record");
            };
            let status = record.pipe.send(copy);
            delivered += 1;

            match status {
                PipeStatus::Ready => i += 1,
                PipeStatus::Release => {
                    trace!("[Distributor] {} released after send", record.pipe.id());
                    record.linked = false;
                    self.linked.remove(i);
                }
            }
        }

        delivered
    }
}
