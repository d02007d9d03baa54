//! # Packet Codec
//!
//! Outgoing packets serialize themselves into a packet group's scratch
//! buffer; incoming packets are decoded by a pooled decoder picked by the
//! leading type byte and handed back to its table after handling.
//!
//! ## Wire Layout
//!
//! ```text
//! ┌────────┬──────────────────────────────┐
//! │ id: u8 │ body (fixed or length-framed) │
//! └────────┴──────────────────────────────┘
//! ```
//!
//! Multi-byte integers are big-endian. Variable-length packets carry their
//! total length (id included) as a `u16` right after the id, so no packet
//! may exceed [`MAX_PACKET_LEN`] bytes.

use std::fmt;

use bytemuck::{bytes_of, Pod};
use shardsync_core::{Pool, Poolable, SanityResult, SanityViolation};

use crate::error::HandlerError;
use crate::transport::Connection;

/// Largest packet a `u16` length prefix can describe.
pub const MAX_PACKET_LEN: usize = u16::MAX as usize;

/// Idle decoder instances kept per packet id.
const IDLE_DECODERS: usize = 64;

/// Appends one packet to a byte vector.
///
/// Writes into a growable pooled buffer, so individual writes cannot fail.
/// A length slot that cannot hold the packet's size is remembered and
/// reported by [`write_packet`].
pub struct PacketWriter<'a> {
    out: &'a mut Vec<u8>,
    start: usize,
    overflowed: bool,
}

impl<'a> PacketWriter<'a> {
    /// Starts a packet at the current end of `out`.
    #[inline]
    pub fn new(out: &'a mut Vec<u8>) -> Self {
        let start = out.len();
        Self {
            out,
            start,
            overflowed: false,
        }
    }

    /// Returns the number of bytes written for this packet.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.out.len() - self.start
    }

    /// Returns true if nothing has been written for this packet.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes a single byte.
    #[inline]
    pub fn write_u8(&mut self, value: u8) {
        self.out.push(value);
    }

    /// Writes a signed byte.
    #[inline]
    pub fn write_i8(&mut self, value: i8) {
        self.out.extend_from_slice(&value.to_be_bytes());
    }

    /// Writes a `u16` in big-endian format.
    #[inline]
    pub fn write_u16(&mut self, value: u16) {
        self.out.extend_from_slice(&value.to_be_bytes());
    }

    /// Writes an `i16` in big-endian format.
    #[inline]
    pub fn write_i16(&mut self, value: i16) {
        self.out.extend_from_slice(&value.to_be_bytes());
    }

    /// Writes a `u32` in big-endian format.
    #[inline]
    pub fn write_u32(&mut self, value: u32) {
        self.out.extend_from_slice(&value.to_be_bytes());
    }

    /// Writes a boolean as one byte.
    #[inline]
    pub fn write_bool(&mut self, value: bool) {
        self.out.push(u8::from(value));
    }

    /// Writes raw bytes.
    #[inline]
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    /// Writes a Pod type directly.
    #[inline]
    pub fn write_pod<T: Pod>(&mut self, value: &T) {
        self.out.extend_from_slice(bytes_of(value));
    }

    /// Writes `text` as ASCII into a fixed-width, zero-padded field.
    ///
    /// Longer text is truncated; non-ASCII characters become `?`.
    pub fn write_ascii_fixed(&mut self, text: &str, width: usize) {
        let mut written = 0;
        for ch in text.chars().take(width) {
            self.out.push(if ch.is_ascii() { ch as u8 } else { b'?' });
            written += 1;
        }
        self.out.resize(self.out.len() + (width - written), 0);
    }

    /// Writes `text` as UTF-8 followed by a zero terminator.
    pub fn write_utf8_null(&mut self, text: &str) {
        self.out.extend_from_slice(text.as_bytes());
        self.out.push(0);
    }

    /// Reserves a `u16` total-length slot and returns its position.
    #[inline]
    pub fn reserve_length(&mut self) -> usize {
        let slot = self.out.len();
        self.out.extend_from_slice(&[0, 0]);
        slot
    }

    /// Fills a slot from [`Self::reserve_length`] with the packet's length so far.
    ///
    /// A length above [`MAX_PACKET_LEN`] leaves the slot untouched and marks
    /// the packet as overflowed.
    pub fn commit_length(&mut self, slot: usize) {
        match u16::try_from(self.len()) {
            Ok(len) => self.out[slot..slot + 2].copy_from_slice(&len.to_be_bytes()),
            Err(_) => self.overflowed = true,
        }
    }

    /// Returns true if a length slot could not hold the packet's size.
    #[inline]
    #[must_use]
    pub const fn is_overflowed(&self) -> bool {
        self.overflowed
    }
}

/// Reads one packet from received bytes.
///
/// Every read returns `None` when the bytes run out, which the caller maps
/// to [`ReadResult::NeedMoreData`].
pub struct PacketReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> PacketReader<'a> {
    /// Creates a reader over the available bytes.
    #[inline]
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Returns the number of bytes consumed so far.
    #[inline]
    #[must_use]
    pub const fn position(&self) -> usize {
        self.position
    }

    /// Returns the number of unread bytes.
    #[inline]
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    /// Reads a single byte.
    #[inline]
    pub fn read_u8(&mut self) -> Option<u8> {
        let value = *self.data.get(self.position)?;
        self.position += 1;
        Some(value)
    }

    /// Reads a big-endian `u16`.
    #[inline]
    pub fn read_u16(&mut self) -> Option<u16> {
        let bytes = self.read_bytes(2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Reads a big-endian `u32`.
    #[inline]
    pub fn read_u32(&mut self) -> Option<u32> {
        let bytes = self.read_bytes(4)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads `len` raw bytes.
    #[inline]
    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.position.checked_add(len)?;
        let bytes = self.data.get(self.position..end)?;
        self.position = end;
        Some(bytes)
    }

    /// Reads a fixed-width, zero-padded ASCII field.
    pub fn read_ascii_fixed(&mut self, width: usize) -> Option<String> {
        let bytes = self.read_bytes(width)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(width);
        Some(bytes[..end].iter().map(|&b| char::from(b)).collect())
    }

    /// Skips `len` bytes.
    #[inline]
    pub fn skip(&mut self, len: usize) -> Option<()> {
        self.read_bytes(len).map(|_| ())
    }
}

/// Outcome of decoding one incoming packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadResult {
    /// Decoded; hand to the game thread.
    Success,
    /// Malformed; skip the bytes read so far and keep going.
    DiscardSingle,
    /// Unrecoverable framing; drop everything buffered.
    DiscardAll,
    /// Incomplete; wait for the next receive.
    NeedMoreData,
}

/// A packet that can be serialized into a packet group.
pub trait OutgoingPacket: Send + Sync {
    /// Leading type byte.
    fn id(&self) -> u8;

    /// Writes the body after the type byte.
    fn write_body(&self, writer: &mut PacketWriter<'_>);

    /// Name used in diagnostics.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Serializes `packet` (type byte and body) onto the end of `out`.
///
/// # Errors
///
/// Returns a [`SanityViolation`] if the packet is too long for its length
/// prefix; `out` is left as it was.
pub fn write_packet(packet: &dyn OutgoingPacket, out: &mut Vec<u8>) -> SanityResult<()> {
    let start = out.len();
    let mut writer = PacketWriter::new(out);
    writer.write_u8(packet.id());
    packet.write_body(&mut writer);
    let (overflowed, len) = (writer.is_overflowed(), writer.len());

    if overflowed {
        out.truncate(start);
        return Err(SanityViolation::new(
            "packet codec",
            format!(
                "packet {:#04x} ({}) is {len} bytes, over the {MAX_PACKET_LEN}-byte length prefix",
                packet.id(),
                packet.name()
            ),
        ));
    }
    Ok(())
}

/// A decoder for one incoming packet kind.
///
/// `S` is the per-connection session state. Instances are reused: `read`
/// runs again on the same instance for a later packet, after [`reset`].
///
/// [`reset`]: IncomingPacket::reset
pub trait IncomingPacket<S>: Send {
    /// Decodes from `reader`, which starts at the type byte.
    fn read(&mut self, reader: &mut PacketReader<'_>) -> ReadResult;

    /// Runs on the game-logic thread with the session locked.
    ///
    /// # Errors
    ///
    /// Errors are logged by the dispatch loop; the connection stays open.
    fn handle(&mut self, conn: &Connection<S>, state: &mut S) -> Result<(), HandlerError>;

    /// Clears decoded fields before the instance goes back to its pool.
    fn reset(&mut self) {}
}

impl<S> Poolable for Box<dyn IncomingPacket<S>> {
    fn reset(&mut self) {
        IncomingPacket::reset(&mut **self);
    }
}

/// Selects a decoder for a leading type byte.
pub trait Protocol<S>: Send + Sync {
    /// Returns a decoder, or `None` for an unknown id.
    fn decoder_for(&self, id: u8) -> Option<Box<dyn IncomingPacket<S>>>;

    /// Takes back a decoder from [`Protocol::decoder_for`] once its packet
    /// was handled or discarded. The default drops it.
    fn recycle(&self, _id: u8, _decoder: Box<dyn IncomingPacket<S>>) {}
}

/// Builds a decoder instance.
pub type DecoderFactory<S> = fn() -> Box<dyn IncomingPacket<S>>;

/// Table-driven [`Protocol`] with one decoder pool per type byte.
pub struct PacketTable<S> {
    slots: Box<[Option<Pool<Box<dyn IncomingPacket<S>>>>]>,
}

impl<S: 'static> PacketTable<S> {
    /// Creates a table with no registered packets.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: (0..256).map(|_| None).collect(),
        }
    }

    /// Registers the decoder factory for `id`, replacing any previous one.
    #[must_use]
    pub fn with(mut self, id: u8, factory: DecoderFactory<S>) -> Self {
        self.slots[usize::from(id)] = Some(Pool::new(IDLE_DECODERS, factory));
        self
    }

    /// Returns true if `id` has a decoder.
    #[must_use]
    pub fn contains(&self, id: u8) -> bool {
        self.slots[usize::from(id)].is_some()
    }

    /// Returns how many decoders were ever built for `id`.
    #[must_use]
    pub fn decoders_built(&self, id: u8) -> usize {
        self.slots[usize::from(id)].as_ref().map_or(0, Pool::created_count)
    }

    /// Returns how many decoders for `id` are idle.
    #[must_use]
    pub fn idle_decoders(&self, id: u8) -> usize {
        self.slots[usize::from(id)].as_ref().map_or(0, Pool::idle_count)
    }
}

impl<S: 'static> Default for PacketTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> fmt::Debug for PacketTable<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered = self.slots.iter().filter(|s| s.is_some()).count();
        f.debug_struct("PacketTable").field("registered", &registered).finish()
    }
}

impl<S: 'static> Protocol<S> for PacketTable<S> {
    fn decoder_for(&self, id: u8) -> Option<Box<dyn IncomingPacket<S>>> {
        self.slots[usize::from(id)].as_ref().map(Pool::acquire)
    }

    fn recycle(&self, id: u8, decoder: Box<dyn IncomingPacket<S>>) {
        if let Some(pool) = &self.slots[usize::from(id)] {
            pool.release(decoder);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ping(u16);

    impl OutgoingPacket for Ping {
        fn id(&self) -> u8 {
            0x73
        }
        fn write_body(&self, writer: &mut PacketWriter<'_>) {
            writer.write_u16(self.0);
        }
    }

    struct Say<'a>(&'a str);

    impl OutgoingPacket for Say<'_> {
        fn id(&self) -> u8 {
            0x1c
        }
        fn write_body(&self, writer: &mut PacketWriter<'_>) {
            let slot = writer.reserve_length();
            writer.write_utf8_null(self.0);
            writer.commit_length(slot);
        }
    }

    #[test]
    fn test_write_fixed_packet() {
        let mut out = Vec::new();
        write_packet(&Ping(0x0102), &mut out).unwrap();
        assert_eq!(out, vec![0x73, 0x01, 0x02]);
    }

    #[test]
    fn test_length_prefix_counts_whole_packet() {
        let mut out = vec![0xff];
        write_packet(&Say("hi"), &mut out).unwrap();
        // id + len(2) + "hi" + nul = 6
        assert_eq!(&out[1..], &[0x1c, 0x00, 0x06, b'h', b'i', 0]);
    }

    #[test]
    fn test_oversized_packet_is_rejected() {
        let text = "x".repeat(MAX_PACKET_LEN);
        let mut out = vec![0xff];
        let err = write_packet(&Say(&text), &mut out).unwrap_err();
        assert_eq!(err.context, "packet codec");
        assert_eq!(out, vec![0xff]);

        // Exactly at the limit still fits: id + len(2) + text + nul.
        let text = "x".repeat(MAX_PACKET_LEN - 4);
        write_packet(&Say(&text), &mut out).unwrap();
        assert_eq!(out.len(), 1 + MAX_PACKET_LEN);
        assert_eq!(&out[2..4], &[0xff, 0xff]);
    }

    #[test]
    fn test_ascii_fixed_pads_and_truncates() {
        let mut out = Vec::new();
        let mut w = PacketWriter::new(&mut out);
        w.write_ascii_fixed("abc", 5);
        w.write_ascii_fixed("toolong", 3);
        assert_eq!(out, b"abc\0\0too".to_vec());

        let mut r = PacketReader::new(&out);
        assert_eq!(r.read_ascii_fixed(5).as_deref(), Some("abc"));
        assert_eq!(r.read_ascii_fixed(3).as_deref(), Some("too"));
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_reader_runs_out() {
        let data = [0x00, 0x01, 0x02];
        let mut r = PacketReader::new(&data);
        assert_eq!(r.read_u16(), Some(1));
        assert_eq!(r.read_u16(), None);
        assert_eq!(r.position(), 2);
        assert_eq!(r.read_u8(), Some(2));
    }

    #[derive(Default)]
    struct Nop {
        seen: Option<u8>,
    }

    impl IncomingPacket<()> for Nop {
        fn read(&mut self, reader: &mut PacketReader<'_>) -> ReadResult {
            match reader.read_u8() {
                Some(id) => {
                    self.seen = Some(id);
                    ReadResult::Success
                }
                None => ReadResult::NeedMoreData,
            }
        }
        fn handle(&mut self, _: &Connection<()>, _: &mut ()) -> Result<(), HandlerError> {
            Ok(())
        }
        fn reset(&mut self) {
            self.seen = None;
        }
    }

    fn nop() -> Box<dyn IncomingPacket<()>> {
        Box::new(Nop::default())
    }

    #[test]
    fn test_packet_table_lookup() {
        let table = PacketTable::new().with(0x02, nop);
        assert!(table.contains(0x02));
        assert!(table.decoder_for(0x02).is_some());
        assert!(table.decoder_for(0x03).is_none());
    }

    #[test]
    fn test_decoders_are_recycled() {
        let table = PacketTable::new().with(0x02, nop);

        for _ in 0..10 {
            let mut decoder = table.decoder_for(0x02).unwrap();
            let mut reader = PacketReader::new(&[0x02]);
            assert_eq!(decoder.read(&mut reader), ReadResult::Success);
            table.recycle(0x02, decoder);
        }

        assert_eq!(table.decoders_built(0x02), 1);
        assert_eq!(table.idle_decoders(0x02), 1);

        // Unknown ids are dropped, not pooled.
        table.recycle(0x03, nop());
        assert_eq!(table.idle_decoders(0x03), 0);
    }
}
