//! Messages as three refcounted chunks.
//!
//! A [`Message`] is opaque to the Distributor: it only ever shares the three
//! chunks. Transports split it into a protocol header, ancillary records
//! (for example the opcode a frame arrived with) and the body.

use crate::chunk::{Chunk, Shares};
use crate::error::Result;

/// Ancillary record kinds understood by the bundled transports.
pub mod kind {
    /// Originating WebSocket opcode (one byte).
    pub const WS_OPCODE: u8 = 1;
}

/// One message travelling through pipes.
///
/// Ancillary records are encoded back to back as `[kind][len][data; len]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Protocol header prepended to the body on the wire.
    pub header: Chunk,
    /// Ancillary records, never sent on the wire.
    pub ancillary: Chunk,
    /// Application payload.
    pub body: Chunk,
}

impl Message {
    /// Create an empty message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a message around an existing body chunk.
    #[must_use]
    pub fn from_body(body: Chunk) -> Self {
        Self {
            body,
            ..Self::default()
        }
    }

    /// Create a message whose body is a copy of `data`.
    ///
    /// # Errors
    ///
    /// Fails if the body chunk cannot be allocated.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        Ok(Self::from_body(Chunk::from_slice(data)?))
    }

    #[must_use]
    pub fn with_header(mut self, header: Chunk) -> Self {
        self.header = header;
        self
    }

    /// Header plus body length, the number of payload bytes on the wire.
    #[must_use]
    pub fn len(&self) -> usize {
        self.header.len() + self.body.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append an ancillary record.
    ///
    /// # Errors
    ///
    /// Fails if the ancillary chunk cannot grow.
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than 255 bytes.
    pub fn push_ancillary(&mut self, kind: u8, data: &[u8]) -> Result<()> {
        assert!(data.len() <= usize::from(u8::MAX), "ancillary record too long");
        let start = self.ancillary.len();
        self.ancillary.reallocate(start + 2 + data.len())?;
        let buf = self.ancillary.make_mut()?;
        buf[start] = kind;
        buf[start + 1] = data.len() as u8;
        buf[start + 2..].copy_from_slice(data);
        Ok(())
    }

    /// First ancillary record of the given kind.
    #[must_use]
    pub fn ancillary(&self, kind: u8) -> Option<&[u8]> {
        let mut rest = self.ancillary.as_slice();
        while rest.len() >= 2 {
            let len = usize::from(rest[1]);
            let record = rest.get(2..2 + len)?;
            if rest[0] == kind {
                return Some(record);
            }
            rest = &rest[2 + len..];
        }
        None
    }

    /// Split into `n` messages sharing the same three blocks.
    ///
    /// This message becomes the first share; each chunk gets `n - 1` extra
    /// references in a single atomic step. With `n == 0` the message is
    /// released immediately.
    #[must_use]
    pub fn share(self, n: usize) -> MessageShares {
        let extra = n.saturating_sub(1);
        let shares = MessageShares {
            header: self.header.add_references(extra),
            ancillary: self.ancillary.add_references(extra),
            body: self.body.add_references(extra),
            first: None,
        };
        if n == 0 {
            return shares;
        }
        MessageShares {
            first: Some(self),
            ..shares
        }
    }
}

/// Iterator over the shares produced by [`Message::share`].
pub struct MessageShares {
    first: Option<Message>,
    header: Shares,
    ancillary: Shares,
    body: Shares,
}

impl MessageShares {
    #[must_use]
    pub fn remaining(&self) -> usize {
        usize::from(self.first.is_some()) + self.body.remaining()
    }
}

impl Iterator for MessageShares {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        if let Some(first) = self.first.take() {
            return Some(first);
        }
        Some(Message {
            header: self.header.next()?,
            ancillary: self.ancillary.next()?,
            body: self.body.next()?,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining();
        (n, Some(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ancillary_records() {
        let mut msg = Message::from_slice(b"payload").unwrap();
        assert_eq!(msg.ancillary(kind::WS_OPCODE), None);

        msg.push_ancillary(7, b"abc").unwrap();
        msg.push_ancillary(kind::WS_OPCODE, &[0x2]).unwrap();
        assert_eq!(msg.ancillary(kind::WS_OPCODE), Some(&[0x2][..]));
        assert_eq!(msg.ancillary(7), Some(&b"abc"[..]));
        assert_eq!(msg.ancillary(9), None);
        assert_eq!(msg.len(), 7);
    }

    #[test]
    fn test_share_counts() {
        let msg = Message::from_slice(b"fan").unwrap();
        let probe = msg.body.clone();
        let shares: Vec<Message> = msg.share(4).collect();
        assert_eq!(shares.len(), 4);
        assert_eq!(probe.ref_count(), 5);
        drop(shares);
        assert_eq!(probe.ref_count(), 1);
    }

    #[test]
    fn test_share_zero_releases() {
        let msg = Message::from_slice(b"gone").unwrap();
        let probe = msg.body.clone();
        let mut shares = msg.share(0);
        assert!(shares.next().is_none());
        assert_eq!(probe.ref_count(), 1);
    }

    #[test]
    fn test_partially_consumed_shares_release_rest() {
        let msg = Message::from_slice(b"part").unwrap();
        let probe = msg.body.clone();
        let mut shares = msg.share(3);
        let first = shares.next().unwrap();
        drop(shares);
        assert_eq!(probe.ref_count(), 2);
        drop(first);
        assert_eq!(probe.ref_count(), 1);
    }
}
