//! Zero-copy buffers for compio writes.

#![allow(unsafe_code)]

use bytes::Bytes;

/// `IoBuf` wrapper for [`Bytes`].
///
/// Lets frame headers and chunk-backed payloads go to compio write operations
/// without a `to_vec()` copy.
pub struct IoBytes(Bytes);

impl IoBytes {
    #[must_use]
    pub const fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn into_inner(self) -> Bytes {
        self.0
    }
}

impl From<Bytes> for IoBytes {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

// SAFETY: Bytes is immutable and refcounted, so the pointer stays valid and
// unaliased by writers for as long as the operation holds this value.
unsafe impl compio::buf::IoBuf for IoBytes {
    #[inline]
    fn as_buf_ptr(&self) -> *const u8 {
        self.0.as_ptr()
    }

    #[inline]
    fn buf_len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    fn buf_capacity(&self) -> usize {
        self.0.len()
    }
}
