//! Reference-counted message chunks.
//!
//! A [`Chunk`] is an owned handle to a heap block shared by every message that
//! carries the same bytes. The block holds an atomic reference count, so
//! handles may be released from any thread (one per connection actor) while
//! the Distributor hands shares of the same block to many pipes.
//!
//! Each handle also carries its own view (offset + length) into the block.
//! `trim` only advances the view, and shrinking is a view truncation, so
//! neither ever touches the allocator.
//!
//! This module and `iobuf` are the only places where unsafe code is allowed.

#![allow(unsafe_code)]

use crate::error::{CoreError, Result};
use bytes::Bytes;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicU32, AtomicUsize, Ordering};

/// Tag stored in every live block.
pub const CHUNK_TAG: u32 = 0xdead_cafe;

/// Tag written into a block right before it is freed.
pub const CHUNK_TAG_DEALLOCATED: u32 = 0xbead_feed;

/// Upper bound on the reference count before we consider the counter corrupted.
const MAX_REFCOUNT: usize = isize::MAX as usize;

/// Hook run exactly once when the last reference to a block goes away.
pub type ReleaseHook = Box<dyn FnOnce() + Send + Sync>;

/// Shared block header.
///
/// Invariants:
/// - `data` points to `capacity` zero-initialised bytes (dangling when `capacity == 0`).
/// - `refcount` equals the number of live handles plus unconsumed [`Shares`].
/// - `tag == CHUNK_TAG` for as long as any handle exists.
struct Header {
    tag: AtomicU32,
    refcount: AtomicUsize,
    capacity: usize,
    data: NonNull<u8>,
    release: Option<ReleaseHook>,
}

/// Owned handle to a reference-counted byte block.
pub struct Chunk {
    header: NonNull<Header>,
    offset: usize,
    len: usize,
}

// SAFETY: the header is only mutated through atomics while shared. Bytes are
// written only through `&mut Chunk` after checking the handle is the sole owner.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    /// Allocate a zero-filled chunk of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::OutOfMemory`] when the layout overflows or the
    /// allocator fails.
    pub fn allocate(size: usize) -> Result<Self> {
        Self::build(size, 0, None)
    }

    /// Allocate `size` bytes plus `headroom` spare bytes for in-place growth.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::OutOfMemory`] when `size + headroom` overflows or
    /// the allocator fails.
    pub fn with_headroom(size: usize, headroom: usize) -> Result<Self> {
        Self::build(size, headroom, None)
    }

    /// Allocate a chunk that runs `hook` when the block is finally freed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::OutOfMemory`] on allocation failure; the hook is
    /// dropped without running in that case.
    pub fn with_release<F>(size: usize, hook: F) -> Result<Self>
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self::build(size, 0, Some(Box::new(hook)))
    }

    /// Allocate a chunk holding a copy of `data`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::OutOfMemory`] on allocation failure.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let mut chunk = Self::allocate(data.len())?;
        chunk.sole_mut().copy_from_slice(data);
        Ok(chunk)
    }

    /// An empty chunk. Never touches the allocator for data.
    #[must_use]
    pub fn empty() -> Self {
        let header = Box::new(Header {
            tag: AtomicU32::new(CHUNK_TAG),
            refcount: AtomicUsize::new(1),
            capacity: 0,
            data: NonNull::dangling(),
            release: None,
        });
        Self {
            header: NonNull::from(Box::leak(header)),
            offset: 0,
            len: 0,
        }
    }

    fn build(size: usize, headroom: usize, release: Option<ReleaseHook>) -> Result<Self> {
        let capacity = size
            .checked_add(headroom)
            .ok_or_else(|| CoreError::out_of_memory(size))?;

        let data = if capacity == 0 {
            NonNull::dangling()
        } else {
            let layout =
                Layout::array::<u8>(capacity).map_err(|_| CoreError::out_of_memory(capacity))?;
            // SAFETY: layout has a non-zero size.
            let ptr = unsafe { alloc_zeroed(layout) };
            NonNull::new(ptr).ok_or_else(|| CoreError::out_of_memory(capacity))?
        };

        let header = Box::new(Header {
            tag: AtomicU32::new(CHUNK_TAG),
            refcount: AtomicUsize::new(1),
            capacity,
            data,
            release,
        });

        Ok(Self {
            header: NonNull::from(Box::leak(header)),
            offset: 0,
            len: size,
        })
    }

    #[inline]
    fn header(&self) -> &Header {
        // SAFETY: the header outlives every handle that references it.
        let header = unsafe { self.header.as_ref() };
        let tag = header.tag.load(Ordering::Relaxed);
        assert!(
            tag == CHUNK_TAG,
            "chunk integrity tag mismatch: {tag:#010x}"
        );
        header
    }

    /// Number of bytes visible through this handle.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.len
    }

    /// Same as [`Chunk::size`].
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current number of references to the underlying block.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.header().refcount.load(Ordering::Acquire)
    }

    /// True when this handle is the only reference to its block.
    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.ref_count() == 1
    }

    /// Bytes spare after the end of this view.
    #[must_use]
    pub fn headroom(&self) -> usize {
        self.header().capacity - self.offset - self.len
    }

    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        let header = self.header();
        // SAFETY: offset + len <= capacity and the block is initialised.
        unsafe { std::slice::from_raw_parts(header.data.as_ptr().add(self.offset), self.len) }
    }

    /// Mutable access, only when this handle is the sole owner.
    pub fn get_mut(&mut self) -> Option<&mut [u8]> {
        if self.is_unique() {
            Some(self.sole_mut())
        } else {
            None
        }
    }

    /// Mutable access, copying the view into a fresh block first if shared.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::OutOfMemory`] if the copy cannot be allocated.
    pub fn make_mut(&mut self) -> Result<&mut [u8]> {
        if !self.is_unique() {
            *self = Self::from_slice(self.as_slice())?;
        }
        Ok(self.sole_mut())
    }

    fn sole_mut(&mut self) -> &mut [u8] {
        let header = self.header();
        debug_assert_eq!(header.refcount.load(Ordering::Acquire), 1);
        // SAFETY: sole owner, so no other view aliases these bytes.
        unsafe { std::slice::from_raw_parts_mut(header.data.as_ptr().add(self.offset), self.len) }
    }

    /// Add `n` references at once and hand them out as owned handles.
    ///
    /// The counter is bumped by a single atomic add; each yielded [`Chunk`]
    /// owns one of the new references. Shares that are never taken are
    /// released when the iterator is dropped.
    #[must_use]
    pub fn add_references(&self, n: usize) -> Shares {
        if n > 0 {
            let old = self.header().refcount.fetch_add(n, Ordering::Relaxed);
            assert!(old <= MAX_REFCOUNT - n, "chunk refcount overflow");
        }
        Shares {
            header: self.header,
            offset: self.offset,
            len: self.len,
            remaining: n,
        }
    }

    /// Drop this handle's reference. The block is freed at zero.
    pub fn release(self) {
        drop(self);
    }

    /// Resize the view to `new_size` bytes.
    ///
    /// Shrinking truncates in place regardless of ownership. Growing reuses
    /// headroom when this handle is the sole owner, otherwise the visible
    /// bytes migrate to a fresh block and the old reference is released.
    /// Newly exposed bytes are zero.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::OutOfMemory`] if a fresh block is needed and
    /// cannot be allocated. The handle is unchanged on error.
    pub fn reallocate(&mut self, new_size: usize) -> Result<()> {
        if new_size <= self.len {
            self.len = new_size;
            return Ok(());
        }

        if self.is_unique() && self.offset + new_size <= self.header().capacity {
            let old_len = self.len;
            self.len = new_size;
            self.sole_mut()[old_len..].fill(0);
            return Ok(());
        }

        let mut grown = Self::allocate(new_size)?;
        grown.sole_mut()[..self.len].copy_from_slice(self.as_slice());
        *self = grown;
        Ok(())
    }

    /// Skip the first `n` bytes without copying.
    ///
    /// # Panics
    ///
    /// Panics if `n` is larger than the current size.
    pub fn trim(&mut self, n: usize) {
        assert!(n <= self.len, "trim of {n} bytes past chunk end ({})", self.len);
        self.offset += n;
        self.len -= n;
    }

    /// Convert into [`Bytes`] without copying. The block stays alive for as
    /// long as the returned `Bytes` (or any clone of it) does.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        if self.is_empty() {
            return Bytes::new();
        }
        Bytes::from_owner(self)
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        let header = self.header();
        let old = header.refcount.fetch_sub(1, Ordering::Release);
        assert!(old != 0, "chunk refcount underflow");
        if old != 1 {
            return;
        }
        fence(Ordering::Acquire);

        header.tag.store(CHUNK_TAG_DEALLOCATED, Ordering::Relaxed);
        // SAFETY: last reference; the header was leaked from a Box in `build`/`empty`.
        let mut header = unsafe { Box::from_raw(self.header.as_ptr()) };
        if header.capacity > 0 {
            // SAFETY: same layout as the allocation in `build`.
            unsafe {
                dealloc(
                    header.data.as_ptr(),
                    Layout::from_size_align_unchecked(header.capacity, 1),
                );
            }
        }
        if let Some(hook) = header.release.take() {
            hook();
        }
    }
}

impl Clone for Chunk {
    fn clone(&self) -> Self {
        let old = self.header().refcount.fetch_add(1, Ordering::Relaxed);
        assert!(old < MAX_REFCOUNT, "chunk refcount overflow");
        Self {
            header: self.header,
            offset: self.offset,
            len: self.len,
        }
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self::empty()
    }
}

impl Deref for Chunk {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for Chunk {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl PartialEq<[u8]> for Chunk {
    fn eq(&self, other: &[u8]) -> bool {
        self.as_slice() == other
    }
}

impl Eq for Chunk {}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("len", &self.len)
            .field("offset", &self.offset)
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// References created by [`Chunk::add_references`] that have not been
/// claimed yet.
pub struct Shares {
    header: NonNull<Header>,
    offset: usize,
    len: usize,
    remaining: usize,
}

// SAFETY: a share is a reference count held on behalf of a future `Chunk`.
unsafe impl Send for Shares {}

impl Shares {
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.remaining
    }
}

impl Iterator for Shares {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(Chunk {
            header: self.header,
            offset: self.offset,
            len: self.len,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Shares {}

impl Drop for Shares {
    fn drop(&mut self) {
        for chunk in self.by_ref() {
            drop(chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_allocate_is_zeroed() {
        let chunk = Chunk::allocate(64).unwrap();
        assert_eq!(chunk.size(), 64);
        assert!(chunk.iter().all(|&b| b == 0));
        assert_eq!(chunk.ref_count(), 1);
    }

    #[test]
    fn test_allocate_overflow_is_out_of_memory() {
        let err = Chunk::with_headroom(usize::MAX, 1).unwrap_err();
        assert!(matches!(err, CoreError::OutOfMemory { .. }));
        let err = Chunk::allocate(usize::MAX).unwrap_err();
        assert!(matches!(err, CoreError::OutOfMemory { .. }));
    }

    #[test]
    fn test_release_hook_runs_once_at_zero() {
        let freed = Arc::new(AtomicUsize::new(0));
        let counter = freed.clone();
        let chunk = Chunk::with_release(16, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let other = chunk.clone();
        assert_eq!(chunk.ref_count(), 2);
        chunk.release();
        assert_eq!(freed.load(Ordering::SeqCst), 0);
        assert_eq!(other.ref_count(), 1);
        other.release();
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_add_references_yields_owned_shares() {
        let chunk = Chunk::from_slice(b"shared").unwrap();
        let shares: Vec<Chunk> = chunk.add_references(3).collect();
        assert_eq!(chunk.ref_count(), 4);
        assert!(shares.iter().all(|s| s.as_slice() == b"shared"));
        drop(shares);
        assert_eq!(chunk.ref_count(), 1);
    }

    #[test]
    fn test_unclaimed_shares_are_released() {
        let chunk = Chunk::from_slice(b"x").unwrap();
        let mut shares = chunk.add_references(5);
        let first = shares.next().unwrap();
        drop(shares);
        assert_eq!(chunk.ref_count(), 2);
        drop(first);
        assert_eq!(chunk.ref_count(), 1);
    }

    #[test]
    fn test_shrink_is_truncation() {
        let mut chunk = Chunk::from_slice(&pattern(100)).unwrap();
        let shared = chunk.clone();
        chunk.reallocate(10).unwrap();
        assert_eq!(chunk.as_slice(), &pattern(100)[..10]);
        // Still the same block.
        assert_eq!(chunk.ref_count(), 2);
        chunk.reallocate(10).unwrap();
        assert_eq!(chunk.size(), 10);
        assert_eq!(shared.size(), 100);
    }

    #[test]
    fn test_grow_in_place_uses_headroom() {
        let mut chunk = Chunk::with_headroom(8, 24).unwrap();
        chunk.get_mut().unwrap().copy_from_slice(b"abcdefgh");
        let before = chunk.as_ptr();
        chunk.reallocate(32).unwrap();
        assert_eq!(chunk.as_ptr(), before);
        assert_eq!(&chunk[..8], b"abcdefgh");
        assert!(chunk[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_grow_shared_migrates_bit_for_bit() {
        let mut chunk = Chunk::with_headroom(50, 50).unwrap();
        chunk.get_mut().unwrap().copy_from_slice(&pattern(50));
        let keep = chunk.clone();
        chunk.reallocate(80).unwrap();
        assert_ne!(chunk.as_ptr(), keep.as_ptr());
        assert_eq!(&chunk[..50], &pattern(50)[..]);
        assert_eq!(chunk.ref_count(), 1);
        assert_eq!(keep.ref_count(), 1);
    }

    #[test]
    fn test_trim_advances_start() {
        let data = pattern(40);
        let mut chunk = Chunk::from_slice(&data).unwrap();
        chunk.trim(7);
        assert_eq!(chunk.size(), 33);
        assert_eq!(chunk.as_slice(), &data[7..]);
        chunk.trim(33);
        assert!(chunk.is_empty());
    }

    #[test]
    #[should_panic(expected = "past chunk end")]
    fn test_trim_past_end_panics() {
        let mut chunk = Chunk::allocate(4).unwrap();
        chunk.trim(5);
    }

    #[test]
    fn test_make_mut_copies_when_shared() {
        let mut chunk = Chunk::from_slice(b"abc").unwrap();
        let other = chunk.clone();
        assert!(chunk.get_mut().is_none());
        chunk.make_mut().unwrap()[0] = b'X';
        assert_eq!(chunk.as_slice(), b"Xbc");
        assert_eq!(other.as_slice(), b"abc");
    }

    #[test]
    fn test_into_bytes_keeps_block_alive() {
        let freed = Arc::new(AtomicUsize::new(0));
        let counter = freed.clone();
        let mut chunk = Chunk::with_release(5, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        chunk.get_mut().unwrap().copy_from_slice(b"hello");
        let bytes = chunk.into_bytes();
        assert_eq!(&bytes[..], b"hello");
        assert_eq!(freed.load(Ordering::SeqCst), 0);
        drop(bytes);
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_release_across_threads() {
        let freed = Arc::new(AtomicUsize::new(0));
        let counter = freed.clone();
        let chunk = Chunk::with_release(128, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let handles: Vec<_> = chunk
            .add_references(8)
            .map(|share| {
                std::thread::spawn(move || {
                    let local = share.clone();
                    assert_eq!(local.size(), 128);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(chunk.ref_count(), 1);
        drop(chunk);
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }
}
