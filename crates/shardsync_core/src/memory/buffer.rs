//! # Pooled Byte Buffers
//!
//! Every byte that crosses the transport layer lives in a [`Buffer`] borrowed
//! from a [`BufferPool`]: packet group scratch space, send buffers, and the
//! three receive stages of a connection.

use std::sync::Arc;

use super::pool::{Pool, Poolable};

/// Default nominal buffer size in bytes.
pub const DEFAULT_BUFFER_LEN: usize = 10 * 1024;

/// Buffers that grew past this multiple of their nominal size are shrunk on release.
const SHRINK_FACTOR: usize = 4;

/// A reusable byte buffer with a nominal size.
///
/// The buffer can grow past its nominal size when a payload needs it; it is
/// trimmed back when returned to the pool so one oversized packet does not
/// pin memory forever.
#[derive(Debug)]
pub struct Buffer {
    bytes: Vec<u8>,
    nominal: usize,
}

impl Buffer {
    /// Creates an empty buffer with `nominal` bytes reserved.
    #[must_use]
    pub fn new(nominal: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(nominal),
            nominal,
        }
    }

    /// Returns the nominal size.
    #[inline]
    #[must_use]
    pub const fn nominal_len(&self) -> usize {
        self.nominal
    }

    /// Returns the number of bytes written.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns true if no bytes have been written.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns the written bytes.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns the backing vector for appending writers.
    #[inline]
    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.bytes
    }

    /// Appends bytes.
    #[inline]
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    /// Discards all written bytes.
    #[inline]
    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    /// Returns the buffer as a zero-filled block of at least its nominal
    /// size. A block grown by [`Self::block_of`] keeps its length.
    ///
    /// Used by stages that manage their own cursors (receive reassembly).
    pub fn as_block_mut(&mut self) -> &mut [u8] {
        if self.bytes.len() < self.nominal {
            self.bytes.resize(self.nominal, 0);
        }
        &mut self.bytes
    }

    /// Returns a block of at least `len` bytes for an in-place transform.
    pub fn block_of(&mut self, len: usize) -> &mut [u8] {
        let len = len.max(self.nominal);
        if self.bytes.len() < len {
            self.bytes.resize(len, 0);
        }
        &mut self.bytes[..len]
    }

    /// Shortens the written region to `len` bytes.
    #[inline]
    pub fn truncate(&mut self, len: usize) {
        self.bytes.truncate(len);
    }

    /// Converts the written bytes into an owned, non-pooled slice.
    #[must_use]
    pub fn to_boxed(&self) -> Box<[u8]> {
        self.bytes.clone().into_boxed_slice()
    }
}

impl Poolable for Buffer {
    fn reset(&mut self) {
        self.bytes.clear();
        if self.bytes.capacity() > self.nominal * SHRINK_FACTOR {
            self.bytes.shrink_to(self.nominal);
        }
    }
}

/// Shared pool of [`Buffer`]s of one nominal size.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<Pool<Buffer>>,
    buffer_len: usize,
}

impl BufferPool {
    /// Creates a pool handing out buffers of `buffer_len` nominal bytes.
    #[must_use]
    pub fn new(buffer_len: usize, max_idle: usize) -> Self {
        Self {
            inner: Arc::new(Pool::new(max_idle, move || Buffer::new(buffer_len))),
            buffer_len,
        }
    }

    /// Takes a cleared buffer.
    #[inline]
    #[must_use]
    pub fn acquire(&self) -> Buffer {
        self.inner.acquire()
    }

    /// Returns a buffer to the pool.
    #[inline]
    pub fn release(&self, buffer: Buffer) {
        self.inner.release(buffer);
    }

    /// Returns the nominal buffer size.
    #[inline]
    #[must_use]
    pub const fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    /// Returns the number of buffers currently handed out.
    #[inline]
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding()
    }

    /// Returns the number of buffers ever built.
    #[inline]
    #[must_use]
    pub fn created_count(&self) -> usize {
        self.inner.created_count()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_LEN, 256)
    }
}
