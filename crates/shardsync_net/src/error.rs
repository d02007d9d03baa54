//! # Transport Error Types
//!
//! Faults are split by blast radius:
//! - [`ProtocolFault`] closes the one connection it came from
//! - [`TransportError`] is returned to the caller of an engine operation
//! - [`HandlerError`] from a packet handler is logged and the loop moves on

use shardsync_core::SanityViolation;
use thiserror::Error;

/// Errors raised by a compressor or cipher plug-in.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The output region cannot hold the transformed bytes.
    #[error("output too small: need {needed} bytes, have {available}")]
    OutputTooSmall {
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        available: usize,
    },

    /// The input is not a valid encoding.
    #[error("corrupt input: {0}")]
    Corrupt(String),
}

/// Faults that close the connection they were detected on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolFault {
    /// The encryption handshake bytes were not recognized.
    #[error("encryption handshake rejected")]
    HandshakeRejected,

    /// The receive buffer filled up without yielding a packet.
    #[error("receive buffer full ({capacity} bytes) without a complete packet")]
    ReceiveBufferFull {
        /// Buffer capacity in bytes.
        capacity: usize,
    },

    /// A compressed frame would not fit even at the frame limit.
    #[error("compressed frame exceeds the {limit}-byte frame limit")]
    FrameTooLarge {
        /// Frame limit in bytes.
        limit: usize,
    },

    /// Decryption or decompression failed.
    #[error("codec failure: {0}")]
    Codec(#[from] CodecError),
}

/// Errors returned by transport engine operations.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Socket or thread spawn failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A send was attempted before the encryption handshake finished.
    #[error("connection {0} has not finished its encryption handshake")]
    NotNegotiated(u32),

    /// The connection was already closed.
    #[error("connection {0} is closed")]
    Closed(u32),

    /// The session's rejection hook refused the connection.
    #[error("connection to {0} rejected by session")]
    Rejected(std::net::SocketAddr),

    /// The engine has been shut down.
    #[error("transport engine is shut down")]
    ShutDown,

    /// Compressor or cipher failure on the send path.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Internal invariant violation.
    #[error(transparent)]
    Sanity(#[from] SanityViolation),
}

/// Error type returned by packet handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
