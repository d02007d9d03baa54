//! # SHARDSYNC Net
//!
//! Packet Groups and the asynchronous transport engine.
//!
//! ## Send Path
//!
//! ```text
//! game thread              sender threads                 io runtime
//! ───────────              ──────────────                 ──────────
//! PacketGroup::add_packet
//! conn.send_packet_group ─► lane[id % n] ─► compress once
//!                                           encrypt per conn ─► write task ─► socket
//! ```
//!
//! ## Receive Path
//!
//! ```text
//! socket ─► read task ─► decrypt ─► decompress ─► parse ─► incoming ─► engine.cycle()
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//! use shardsync_net::{ConnectionId, ConnectionState, PacketTable, TransportEngine};
//!
//! struct Session;
//!
//! impl ConnectionState for Session {
//!     fn create(_id: ConnectionId, _peer: SocketAddr) -> Self {
//!         Session
//!     }
//! }
//!
//! let mut engine = TransportEngine::builder(Arc::new(PacketTable::<Session>::new()))
//!     .build()
//!     .expect("engine");
//! let server = engine.listen("127.0.0.1:0".parse().unwrap()).expect("listen");
//! println!("listening on {}", server.local_addr());
//!
//! loop {
//!     engine.cycle();
//!     # break;
//! }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod error;
pub mod protocol;
pub mod transport;

pub use error::{CodecError, HandlerError, ProtocolFault, TransportError, TransportResult};
pub use protocol::{
    write_packet, Cipher, CipherFactory, CipherInit, Compressor, GroupMode, IncomingPacket, Lz4Compressor,
    OutgoingPacket, PacketGroup, PacketGroupPool, PacketReader, PacketTable, PacketWriter, Protocol, ReadResult,
    MAX_PACKET_LEN,
};
pub use transport::{
    Client, Connection, ConnectionId, ConnectionState, CycleStats, PacketSink, Server, TransportBuilder,
    TransportConfig, TransportEngine, DEFAULT_FRAME_LIMIT,
};
