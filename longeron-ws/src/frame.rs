//! RFC 6455 frame layout.
//!
//! ```text
//!  0               1               2               3
//!  7 6 5 4 3 2 1 0 7 6 5 4 3 2 1 0 ...
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |            (16/64)            |
//! |N|V|V|V|       |S|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Masking-key (0 or 4 bytes), then payload                  |
//! +---------------------------------------------------------------+
//! ```

use bytes::{BufMut, BytesMut};

/// Final fragment flag.
pub const FIN: u8 = 0x80;

/// RSV1..RSV3; no extensions are negotiated so they must be zero.
pub const RSV_MASK: u8 = 0x70;

pub const OPCODE_MASK: u8 = 0x0F;

/// Mask flag in the second header byte.
pub const MASK_BIT: u8 = 0x80;

pub const PAYLOAD_LEN_MASK: u8 = 0x7F;

/// 7-bit length value announcing a 16-bit extended length.
pub const LEN_16: u8 = 126;

/// 7-bit length value announcing a 64-bit extended length.
pub const LEN_64: u8 = 127;

/// Largest payload carried by the 7-bit length itself.
pub const MAX_SHORT_PAYLOAD: usize = 125;

/// Control frames never carry more than this.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

pub const BASE_HEADER_LEN: usize = 2;
pub const MASK_LEN: usize = 4;

/// 2 base bytes, 8 extended length bytes, 4 mask bytes.
pub const MAX_HEADER_LEN: usize = 14;

/// Frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Decode the low nibble of a header byte. Reserved opcodes give `None`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value & OPCODE_MASK {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Continuation => "CONTINUATION",
            Self::Text => "TEXT",
            Self::Binary => "BINARY",
            Self::Close => "CLOSE",
            Self::Ping => "PING",
            Self::Pong => "PONG",
        }
    }
}

/// Which end of the connection a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted side; receives masked frames, sends unmasked ones.
    Server,
    /// Connecting side; masks everything it sends.
    Client,
}

impl Role {
    #[must_use]
    pub const fn expects_masked_input(self) -> bool {
        matches!(self, Self::Server)
    }

    #[must_use]
    pub const fn masks_output(self) -> bool {
        matches!(self, Self::Client)
    }
}

/// The two fixed header bytes, split into fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseHeader {
    pub fin: bool,
    pub rsv: u8,
    pub opcode: u8,
    pub masked: bool,
    pub len7: u8,
}

impl BaseHeader {
    #[must_use]
    pub const fn parse(b0: u8, b1: u8) -> Self {
        Self {
            fin: b0 & FIN != 0,
            rsv: b0 & RSV_MASK,
            opcode: b0 & OPCODE_MASK,
            masked: b1 & MASK_BIT != 0,
            len7: b1 & PAYLOAD_LEN_MASK,
        }
    }

    /// Bytes that follow the base header: extended length plus mask.
    #[must_use]
    pub const fn ext_len(&self) -> usize {
        ext_header_len(self.len7, self.masked)
    }
}

/// Extended header size for a 7-bit length value and mask flag.
#[must_use]
pub const fn ext_header_len(len7: u8, masked: bool) -> usize {
    let len_bytes = match len7 {
        LEN_16 => 2,
        LEN_64 => 8,
        _ => 0,
    };
    if masked {
        len_bytes + MASK_LEN
    } else {
        len_bytes
    }
}

/// Read the true payload length from the extended header bytes.
///
/// `ext` starts right after the base header. Returns `None` when `ext` is
/// too short for the announced form.
#[must_use]
pub fn decode_payload_len(len7: u8, ext: &[u8]) -> Option<u64> {
    match len7 {
        LEN_16 => ext.get(..2).map(|b| u64::from(u16::from_be_bytes([b[0], b[1]]))),
        LEN_64 => {
            let bytes: [u8; 8] = ext.get(..8)?.try_into().ok()?;
            Some(u64::from_be_bytes(bytes))
        }
        short => Some(u64::from(short)),
    }
}

/// Masking key position inside the extended header, if masked.
#[must_use]
pub fn mask_from_ext(len7: u8, ext: &[u8]) -> Option<[u8; 4]> {
    let at = ext_header_len(len7, false);
    ext.get(at..at + MASK_LEN)?.try_into().ok()
}

/// Append a frame header for a payload of `payload_len` bytes.
pub fn encode_header(buf: &mut BytesMut, first: u8, payload_len: usize, mask: Option<[u8; 4]>) {
    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
    buf.put_u8(first);
    if payload_len <= MAX_SHORT_PAYLOAD {
        buf.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= usize::from(u16::MAX) {
        buf.put_u8(mask_bit | LEN_16);
        buf.put_u16(payload_len as u16);
    } else {
        buf.put_u8(mask_bit | LEN_64);
        buf.put_u64(payload_len as u64);
    }
    if let Some(key) = mask {
        buf.put_slice(&key);
    }
}

/// XOR `data` with `mask`, starting at key offset `pos`.
///
/// Returns the offset to continue with, so a payload split across several
/// buffers can be masked piecewise.
pub fn apply_mask(data: &mut [u8], mask: [u8; 4], pos: usize) -> usize {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[(pos + i) % 4];
    }
    (pos + data.len()) % 4
}
