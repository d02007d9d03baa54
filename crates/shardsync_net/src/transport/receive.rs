//! # Receive Pipeline
//!
//! Turns raw socket bytes into decoded packets, one connection at a time.
//!
//! ```text
//!  socket ──► raw ──decrypt──► plain ──decompress──► packets ──parse──► emit
//!              ▲                                      offset..end
//!              └── handshake runs here until the cipher is negotiated
//! ```
//!
//! Each stage is a pooled block of the nominal buffer size. The parse stage
//! keeps a read offset and an end cursor so a packet split across receives
//! is completed by the next one. Unconsumed bytes move back to the start of
//! the block when the offset passes half the block or the block is full.
//!
//! A compressed frame is decoded as a whole, so the plain and packet stages
//! grow to fit one frame, up to the pipeline's frame limit. The raw stage
//! never grows.
//!
//! The pipeline never touches a socket, so it is driven directly in tests.

use shardsync_core::{Buffer, BufferPool};

use crate::error::{CodecError, ProtocolFault};
use crate::protocol::{CipherInit, CipherSlot, Compressor, IncomingPacket, PacketReader, Protocol, ReadResult};

/// Default upper bound for one compressed frame, in bytes.
pub const DEFAULT_FRAME_LIMIT: usize = 256 * 1024;

/// Per-connection reassembly state.
pub struct ReceivePipeline {
    buffers: BufferPool,
    capacity: usize,
    frame_limit: usize,
    raw: Buffer,
    raw_len: usize,
    plain: Buffer,
    plain_len: usize,
    packets: Buffer,
    offset: usize,
    end: usize,
    decoded: u64,
}

impl ReceivePipeline {
    /// Borrows three blocks from `buffers`, with [`DEFAULT_FRAME_LIMIT`].
    #[must_use]
    pub fn new(buffers: &BufferPool) -> Self {
        Self::with_frame_limit(buffers, DEFAULT_FRAME_LIMIT)
    }

    /// Borrows three blocks from `buffers`.
    ///
    /// The plain and packet stages may grow up to `frame_limit` bytes (never
    /// below the nominal block size) to hold one decompressed frame.
    #[must_use]
    pub fn with_frame_limit(buffers: &BufferPool, frame_limit: usize) -> Self {
        let mut raw = buffers.acquire();
        let mut plain = buffers.acquire();
        let mut packets = buffers.acquire();
        let capacity = raw.as_block_mut().len();
        plain.as_block_mut();
        packets.as_block_mut();

        Self {
            buffers: buffers.clone(),
            capacity,
            frame_limit: frame_limit.max(capacity),
            raw,
            raw_len: 0,
            plain,
            plain_len: 0,
            packets,
            offset: 0,
            end: 0,
            decoded: 0,
        }
    }

    /// Returns the nominal per-stage capacity in bytes.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the largest size the plain and packet stages may grow to.
    #[inline]
    #[must_use]
    pub const fn frame_limit(&self) -> usize {
        self.frame_limit
    }

    /// Returns the current sizes of the plain and packet stages.
    #[must_use]
    pub fn stage_sizes(&self) -> (usize, usize) {
        (self.plain.len(), self.packets.len())
    }

    /// Returns the free tail of the raw block for the next socket read.
    ///
    /// Empty when the raw block is full.
    pub fn receive_space(&mut self) -> &mut [u8] {
        let raw_len = self.raw_len;
        &mut self.raw.as_block_mut()[raw_len..]
    }

    /// Records `n` bytes written into [`Self::receive_space`].
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.raw_len + n <= self.capacity, "commit past receive space");
        self.raw_len = (self.raw_len + n).min(self.capacity);
    }

    /// Copies `data` into the receive space and commits it.
    ///
    /// Returns the number of bytes accepted.
    pub fn push_bytes(&mut self, data: &[u8]) -> usize {
        let space = self.receive_space();
        let n = data.len().min(space.len());
        space[..n].copy_from_slice(&data[..n]);
        self.commit(n);
        n
    }

    /// Returns the number of bytes waiting in any stage.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.raw_len + self.plain_len + (self.end - self.offset)
    }

    /// Returns the parse stage's read offset and end cursor.
    #[must_use]
    pub const fn cursors(&self) -> (usize, usize) {
        (self.offset, self.end)
    }

    /// Returns how many packets were decoded over the pipeline's life.
    #[must_use]
    pub const fn decoded_count(&self) -> u64 {
        self.decoded
    }

    /// Runs every stage until no more progress is possible.
    ///
    /// Decoded packets are passed to `emit` with their type byte, in arrival
    /// order. Discarded decoders go straight back to `protocol`.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolFault`] if the handshake is rejected, a codec
    /// fails, a stage fills up without yielding a packet, or a compressed
    /// frame exceeds the frame limit. The caller closes the connection.
    pub fn process<S>(
        &mut self,
        cipher: &mut CipherSlot,
        compressor: Option<&dyn Compressor>,
        protocol: &dyn Protocol<S>,
        emit: &mut dyn FnMut(u8, Box<dyn IncomingPacket<S>>),
    ) -> Result<(), ProtocolFault> {
        if !self.handshake(cipher)? {
            return Ok(());
        }

        loop {
            let moved = self.decrypt_stage(cipher) | self.decompress_stage(compressor)?;
            let parsed = self.parse_stage(protocol, emit);
            self.compact();

            if !moved && !parsed {
                break;
            }
        }

        self.check_full()
    }

    /// Returns true once the cipher is negotiated.
    fn handshake(&mut self, cipher: &mut CipherSlot) -> Result<bool, ProtocolFault> {
        let CipherSlot::Pending(pending) = cipher else {
            return Ok(true);
        };

        let raw_len = self.raw_len;
        let outcome = pending.init(&self.raw.as_block_mut()[..raw_len]);
        let (consumed, use_cipher) = match outcome {
            CipherInit::UseCipher { consumed } => (consumed, true),
            CipherInit::NoCipher { consumed } => (consumed, false),
            CipherInit::NeedMoreData => {
                if self.raw_len == self.capacity {
                    return Err(ProtocolFault::ReceiveBufferFull { capacity: self.capacity });
                }
                return Ok(false);
            }
            CipherInit::Invalid => return Err(ProtocolFault::HandshakeRejected),
        };

        cipher.resolve(use_cipher);
        self.consume_raw(consumed.min(self.raw_len));
        tracing::debug!(encrypted = use_cipher, consumed, "encryption handshake completed");
        Ok(true)
    }

    fn decrypt_stage(&mut self, cipher: &mut CipherSlot) -> bool {
        let n = self.raw_len.min(self.plain.len() - self.plain_len);
        if n == 0 {
            return false;
        }

        let raw = self.raw.as_block_mut();
        let plain = &mut self.plain.as_block_mut()[self.plain_len..];
        let written = match cipher {
            CipherSlot::Active(c) => c.decrypt(&raw[..n], plain),
            CipherSlot::Plain | CipherSlot::Pending(_) => {
                plain[..n].copy_from_slice(&raw[..n]);
                n
            }
        };

        self.plain_len += written;
        self.consume_raw(n);
        true
    }

    fn decompress_stage(&mut self, compressor: Option<&dyn Compressor>) -> Result<bool, ProtocolFault> {
        if self.plain_len == 0 {
            return Ok(false);
        }
        let Some(compressor) = compressor else {
            return Ok(self.copy_plain());
        };
        if self.offset > 0 {
            self.packets.as_block_mut().copy_within(self.offset..self.end, 0);
            self.end -= self.offset;
            self.offset = 0;
        }

        loop {
            let plain_full = self.plain_len == self.plain.len();
            let plain = self.plain.as_block_mut();
            let packets = &mut self.packets.as_block_mut()[self.end..];

            match compressor.decompress(&plain[..self.plain_len], packets) {
                Ok(d) if d.consumed == 0 && d.produced == 0 => {
                    // An incomplete frame that already fills the plain stage.
                    if plain_full {
                        self.grow_plain()?;
                        return Ok(true);
                    }
                    return Ok(false);
                }
                Ok(d) => {
                    plain.copy_within(d.consumed..self.plain_len, 0);
                    self.plain_len -= d.consumed;
                    self.end += d.produced;
                    return Ok(true);
                }
                Err(CodecError::OutputTooSmall { needed, .. }) => self.grow_packets(self.end + needed)?,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Pass-through when no compressor is configured.
    fn copy_plain(&mut self) -> bool {
        let plain = self.plain.as_block_mut();
        let packets = &mut self.packets.as_block_mut()[self.end..];
        let n = self.plain_len.min(packets.len());
        if n == 0 {
            return false;
        }
        packets[..n].copy_from_slice(&plain[..n]);
        plain.copy_within(n..self.plain_len, 0);
        self.plain_len -= n;
        self.end += n;
        true
    }

    fn grow_plain(&mut self) -> Result<(), ProtocolFault> {
        let current = self.plain.len();
        let target = (current * 2).min(self.frame_limit);
        if target <= current {
            return Err(ProtocolFault::FrameTooLarge { limit: self.frame_limit });
        }
        self.plain.block_of(target);
        tracing::debug!(from = current, to = target, "plain stage grown for a large frame");
        Ok(())
    }

    fn grow_packets(&mut self, required: usize) -> Result<(), ProtocolFault> {
        if required > self.frame_limit {
            return Err(ProtocolFault::FrameTooLarge { limit: self.frame_limit });
        }
        let current = self.packets.len();
        self.packets.block_of(required);
        tracing::debug!(from = current, to = required, "packet stage grown for a large frame");
        Ok(())
    }

    fn parse_stage<S>(
        &mut self,
        protocol: &dyn Protocol<S>,
        emit: &mut dyn FnMut(u8, Box<dyn IncomingPacket<S>>),
    ) -> bool {
        let mut progressed = false;
        let packets = self.packets.as_block_mut();

        while self.offset < self.end {
            let id = packets[self.offset];
            let Some(mut decoder) = protocol.decoder_for(id) else {
                tracing::warn!(
                    packet_id = id,
                    discarded = self.end - self.offset,
                    "unknown packet id, discarding buffered data"
                );
                self.offset = 0;
                self.end = 0;
                return true;
            };

            let mut reader = PacketReader::new(&packets[self.offset..self.end]);
            match decoder.read(&mut reader) {
                ReadResult::Success => {
                    self.offset += reader.position().max(1);
                    self.decoded += 1;
                    progressed = true;
                    emit(id, decoder);
                }
                ReadResult::DiscardSingle => {
                    tracing::debug!(packet_id = id, len = reader.position(), "discarding malformed packet");
                    self.offset += reader.position().max(1);
                    progressed = true;
                    protocol.recycle(id, decoder);
                }
                ReadResult::DiscardAll => {
                    tracing::debug!(packet_id = id, "discarding all buffered data");
                    self.offset = 0;
                    self.end = 0;
                    protocol.recycle(id, decoder);
                    return true;
                }
                ReadResult::NeedMoreData => {
                    protocol.recycle(id, decoder);
                    break;
                }
            }
        }

        progressed
    }

    fn compact(&mut self) {
        let block = self.packets.len();
        if self.offset == self.end {
            self.offset = 0;
            self.end = 0;
        } else if self.offset > block / 2 || (self.end == block && self.offset > 0) {
            self.packets.as_block_mut().copy_within(self.offset..self.end, 0);
            self.end -= self.offset;
            self.offset = 0;
        }
    }

    fn check_full(&self) -> Result<(), ProtocolFault> {
        let packets_stuck = self.end == self.packets.len() && self.offset == 0;
        let plain_stuck = self.plain_len == self.plain.len();
        let raw_stuck = self.raw_len == self.capacity;
        if packets_stuck || plain_stuck || raw_stuck {
            return Err(ProtocolFault::ReceiveBufferFull {
                capacity: self.packets.len(),
            });
        }
        Ok(())
    }

    fn consume_raw(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        let raw_len = self.raw_len;
        self.raw.as_block_mut().copy_within(n..raw_len, 0);
        self.raw_len -= n;
    }
}

impl Drop for ReceivePipeline {
    fn drop(&mut self) {
        for buf in [&mut self.raw, &mut self.plain, &mut self.packets] {
            let taken = std::mem::replace(buf, Buffer::new(0));
            self.buffers.release(taken);
        }
    }
}

impl std::fmt::Debug for ReceivePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivePipeline")
            .field("capacity", &self.capacity)
            .field("frame_limit", &self.frame_limit)
            .field("raw_len", &self.raw_len)
            .field("plain_len", &self.plain_len)
            .field("offset", &self.offset)
            .field("end", &self.end)
            .finish_non_exhaustive()
    }
}
