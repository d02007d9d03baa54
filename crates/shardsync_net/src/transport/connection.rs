//! # Connections
//!
//! Per-socket wrapper shared by the server and client roles.
//!
//! ## Tasks
//!
//! ```text
//!             ┌──────────── Connection ────────────┐
//!  socket ──► │ read task ─► ReceivePipeline ─► incoming queue ──► cycle()
//!             │                                     │
//!  sender  ──►│ writer channel ─► write task ─► socket
//!  threads    │                                     │
//!             └─────────────────────────────────────┘
//! ```
//!
//! ## Closing
//!
//! Whichever path fails first (read, write, protocol fault, explicit call)
//! closes the connection; the close guard makes every later attempt a
//! no-op. The session's `on_close` runs later on the game-logic thread.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use shardsync_core::Buffer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::AbortHandle;

use super::receive::ReceivePipeline;
use super::{EngineShared, IncomingMessage, OutgoingMessage};
use crate::error::{TransportError, TransportResult};
use crate::protocol::{CipherSlot, GroupMode, OutgoingPacket, PacketGroup, SendTicket};

/// Extra output room given to a cipher beyond the input length.
const CIPHER_SLACK: usize = 64;

/// Unique identifier for a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Session state attached to every connection.
///
/// Callbacks other than [`ConnectionState::create`] and
/// [`ConnectionState::allow`] run on the game-logic thread.
pub trait ConnectionState: Sized + Send + 'static {
    /// Builds the session for a freshly opened socket.
    fn create(id: ConnectionId, peer: SocketAddr) -> Self;

    /// Rejection hook, run before the receive loop starts.
    ///
    /// The session is locked during the call; do not call
    /// [`Connection::state`] from here.
    fn allow(&mut self, conn: &Connection<Self>) -> bool {
        let _ = conn;
        true
    }

    /// Called once after the connection closed.
    fn on_close(&mut self, reason: &str) {
        let _ = reason;
    }
}

/// Anything that accepts outgoing packets for one client.
pub trait PacketSink: Send + Sync {
    /// Queues a group for sending. Empty groups are ignored with a warning.
    fn send_packet_group(&self, group: &PacketGroup);

    /// Wraps one packet in a single-use group and queues it.
    fn send_single_packet(&self, packet: &dyn OutgoingPacket);
}

/// Bytes ready for the socket plus the send they complete.
pub(crate) struct OutboundFrame {
    pub(crate) bytes: Buffer,
    pub(crate) ticket: SendTicket,
}

/// One client socket.
pub struct Connection<S> {
    id: ConnectionId,
    peer: SocketAddr,
    me: Weak<Connection<S>>,
    shared: Arc<EngineShared<S>>,
    state: Mutex<S>,
    cipher: Mutex<CipherSlot>,
    writer: Mutex<Option<UnboundedSender<OutboundFrame>>>,
    reader_task: Mutex<Option<AbortHandle>>,
    close_reason: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl<S: ConnectionState> Connection<S> {
    /// Returns the connection id.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the remote address.
    #[inline]
    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Returns true once the connection has been closed.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns the reason the connection was closed with.
    #[must_use]
    pub fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }

    /// Locks the session state.
    ///
    /// Packet handlers already receive the locked state; locking it again
    /// from inside a handler deadlocks.
    pub fn state(&self) -> MutexGuard<'_, S> {
        self.state.lock()
    }

    /// Returns true if the encryption handshake has completed.
    #[must_use]
    pub fn is_negotiated(&self) -> bool {
        self.cipher.lock().is_negotiated()
    }

    /// Closes the connection. Only the first call has any effect.
    ///
    /// A concurrent caller blocks until the first close has queued its
    /// event, so the close is always visible to the next `cycle`.
    pub fn close(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut guard = self.close_reason.lock();
        if guard.is_some() {
            return;
        }
        *guard = Some(reason.clone());
        self.closed.store(true, Ordering::Release);

        // Dropping the sender lets the write task flush what is queued and stop.
        self.writer.lock().take();
        if let Some(reader) = self.reader_task.lock().take() {
            reader.abort();
        }

        tracing::info!(conn = %self.id, peer = %self.peer, reason = %reason, "connection closed");

        if let Some(me) = self.me.upgrade() {
            self.shared.incoming.push(IncomingMessage::Closed { conn: me, reason });
        }
    }

    /// Encrypts (when negotiated) the final bytes of a group into a send buffer.
    pub(crate) fn seal_frame(&self, bytes: &[u8]) -> TransportResult<Buffer> {
        let mut cipher = self.cipher.lock();
        match &mut *cipher {
            CipherSlot::Pending(_) => Err(TransportError::NotNegotiated(self.id.0)),
            CipherSlot::Active(c) => {
                let mut out = self.shared.buffers.acquire();
                let written = c.encrypt(bytes, out.block_of(bytes.len() + CIPHER_SLACK));
                out.truncate(written);
                Ok(out)
            }
            CipherSlot::Plain => {
                let mut out = self.shared.buffers.acquire();
                out.extend_from_slice(bytes);
                Ok(out)
            }
        }
    }

    /// Hands a sealed frame to the write task.
    pub(crate) fn dispatch(&self, frame: OutboundFrame) {
        let writer = self.writer.lock();
        let Some(tx) = writer.as_ref() else {
            self.shared.buffers.release(frame.bytes);
            return;
        };
        if let Err(mpsc::error::SendError(frame)) = tx.send(frame) {
            self.shared.buffers.release(frame.bytes);
        }
    }

    fn enqueue(&self, ticket: SendTicket) {
        let Some(conn) = self.me.upgrade() else {
            return;
        };
        let lane = self.id.0 as usize % self.shared.outgoing.len();
        self.shared.outgoing[lane].push(OutgoingMessage { conn, ticket });
    }
}

impl<S: ConnectionState> PacketSink for Connection<S> {
    fn send_packet_group(&self, group: &PacketGroup) {
        if group.is_empty() {
            tracing::warn!(conn = %self.id, mode = ?group.mode(), "ignoring empty packet group");
            return;
        }
        if self.is_closed() {
            tracing::debug!(conn = %self.id, "dropping send to closed connection");
            return;
        }
        if let Ok(ticket) = group.begin_send() {
            self.enqueue(ticket);
        }
    }

    fn send_single_packet(&self, packet: &dyn OutgoingPacket) {
        if self.is_closed() {
            return;
        }
        if let Ok(group) = self.shared.groups.with_packet(GroupMode::SingleUse, packet) {
            self.send_packet_group(&group);
        }
    }
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Wraps an accepted or connected socket and starts its tasks.
///
/// Returns `None` if the session's rejection hook refused it.
pub(crate) fn open<S: ConnectionState>(
    shared: &Arc<EngineShared<S>>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Option<Arc<Connection<S>>> {
    if shared.config.nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer = %peer, error = %e, "could not disable nagle");
        }
    }

    let id = shared.next_connection_id();
    let cipher = shared
        .cipher_factory
        .as_ref()
        .map_or(CipherSlot::Plain, |factory| CipherSlot::Pending(factory.create()));
    let (tx, rx) = mpsc::unbounded_channel();

    let conn = Arc::new_cyclic(|me| Connection {
        id,
        peer,
        me: me.clone(),
        shared: Arc::clone(shared),
        state: Mutex::new(S::create(id, peer)),
        cipher: Mutex::new(cipher),
        writer: Mutex::new(Some(tx)),
        reader_task: Mutex::new(None),
        close_reason: Mutex::new(None),
        closed: AtomicBool::new(false),
    });

    let allowed = {
        let mut state = conn.state.lock();
        state.allow(&conn)
    };
    if !allowed {
        tracing::info!(conn = %id, peer = %peer, "connection rejected");
        conn.closed.store(true, Ordering::Release);
        *conn.close_reason.lock() = Some("rejected".to_owned());
        return None;
    }

    let (read_half, write_half) = stream.into_split();
    shared.connections.lock().insert(id, Arc::clone(&conn));
    shared.runtime.spawn(write_loop(Arc::clone(&conn), write_half, rx));
    let reader = shared.runtime.spawn(read_loop(Arc::clone(&conn), read_half));
    *conn.reader_task.lock() = Some(reader.abort_handle());
    if conn.is_closed() {
        reader.abort();
    }

    tracing::info!(conn = %id, peer = %peer, "connection opened");
    Some(conn)
}

async fn write_loop<S: ConnectionState>(
    conn: Arc<Connection<S>>,
    mut half: OwnedWriteHalf,
    mut rx: UnboundedReceiver<OutboundFrame>,
) {
    while let Some(OutboundFrame { bytes, ticket }) = rx.recv().await {
        let result = half.write_all(bytes.as_slice()).await;
        conn.shared.buffers.release(bytes);
        drop(ticket);

        if let Err(e) = result {
            conn.close(format!("send failed: {e}"));
            break;
        }
    }

    rx.close();
    while let Ok(frame) = rx.try_recv() {
        conn.shared.buffers.release(frame.bytes);
    }
    if let Err(e) = half.shutdown().await {
        tracing::debug!(conn = %conn.id, error = %e, "socket shutdown failed");
    }
}

async fn read_loop<S: ConnectionState>(conn: Arc<Connection<S>>, mut half: OwnedReadHalf) {
    let shared = Arc::clone(&conn.shared);
    let mut pipeline = ReceivePipeline::with_frame_limit(&shared.buffers, shared.config.max_frame_len);

    let reason = loop {
        let n = match half.read(pipeline.receive_space()).await {
            Ok(0) => break "remote closed".to_owned(),
            Ok(n) => n,
            Err(e) => break format!("receive failed: {e}"),
        };
        pipeline.commit(n);

        let result = {
            let mut cipher = conn.cipher.lock();
            pipeline.process(
                &mut cipher,
                shared.compressor.as_deref(),
                shared.protocol.as_ref(),
                &mut |id, packet| {
                    shared.incoming.push(IncomingMessage::Packet {
                        conn: Arc::clone(&conn),
                        id,
                        packet,
                    });
                },
            )
        };
        if let Err(fault) = result {
            break fault.to_string();
        }
        if conn.is_closed() {
            return;
        }
    };

    conn.close(reason);
}
