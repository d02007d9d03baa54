//! # Wire Protocol
//!
//! Everything that turns packets into bytes and back:
//! - [`packet`]: packet traits, writer/reader and the decoder table
//! - [`codec`]: compressor and cipher plug-ins
//! - [`group`]: packet groups and their pool

pub mod codec;
pub mod group;
pub mod packet;

pub use codec::{Cipher, CipherFactory, CipherInit, CipherSlot, Compressor, Decompressed, Lz4Compressor};
pub use group::{GroupError, GroupMode, PacketGroup, PacketGroupPool, SendTicket, DEFAULT_IDLE_GROUPS};
pub use packet::{
    write_packet, DecoderFactory, IncomingPacket, OutgoingPacket, PacketReader, PacketTable, PacketWriter, MAX_PACKET_LEN,
    Protocol, ReadResult,
};
