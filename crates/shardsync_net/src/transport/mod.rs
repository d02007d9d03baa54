//! # Transport Engine
//!
//! Asynchronous send/receive pipeline shared by the server and client roles.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      TRANSPORT ENGINE                         │
//! ├───────────────────────────────────────────────────────────────┤
//! │  any thread ──send_packet_group──► outgoing lanes (swap)      │
//! │                                         │                     │
//! │                            sender threads (compress/encrypt)  │
//! │                                         │                     │
//! │  tokio runtime:  write tasks ◄──────────┘                     │
//! │                  read tasks ──► ReceivePipeline ──► incoming  │
//! │                                                       │       │
//! │  game thread:    cycle() ◄── swap ────────────────────┘       │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Packet handlers and session callbacks only run inside [`TransportEngine::cycle`],
//! on the thread that owns game state.

mod client;
mod connection;
mod receive;
mod sender;
mod server;

pub use client::Client;
pub use connection::{Connection, ConnectionId, ConnectionState, PacketSink};
pub use receive::{ReceivePipeline, DEFAULT_FRAME_LIMIT};
pub use server::Server;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use shardsync_core::{BufferPool, SwapQueue, DEFAULT_BUFFER_LEN};

use crate::error::{TransportError, TransportResult};
use crate::protocol::{CipherFactory, Compressor, IncomingPacket, PacketGroupPool, Protocol, SendTicket};

/// How long shutdown waits for in-flight socket tasks.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Transport configuration.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Number of sender threads (and outgoing lanes).
    pub sender_threads: usize,
    /// Worker threads of the socket I/O runtime.
    pub io_threads: usize,
    /// Nominal size of every pooled buffer, and the receive stage capacity.
    pub buffer_len: usize,
    /// Idle buffers kept by the buffer pool.
    pub max_idle_buffers: usize,
    /// How often an idle sender thread re-checks the stop flag.
    pub stop_poll_ms: u64,
    /// Disable Nagle's algorithm on every socket.
    pub nodelay: bool,
    /// Largest decompressed frame a receive pipeline grows to hold.
    pub max_frame_len: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            sender_threads: 2,
            io_threads: 2,
            buffer_len: DEFAULT_BUFFER_LEN,
            max_idle_buffers: 512,
            stop_poll_ms: 100,
            nodelay: true,
            max_frame_len: DEFAULT_FRAME_LIMIT,
        }
    }
}

/// A queued send.
pub(crate) struct OutgoingMessage<S> {
    pub(crate) conn: Arc<Connection<S>>,
    pub(crate) ticket: SendTicket,
}

/// Work for the game-logic thread.
pub(crate) enum IncomingMessage<S> {
    Packet {
        conn: Arc<Connection<S>>,
        id: u8,
        packet: Box<dyn IncomingPacket<S>>,
    },
    Closed {
        conn: Arc<Connection<S>>,
        reason: String,
    },
}

/// State shared by the engine, its threads and its connections.
pub(crate) struct EngineShared<S> {
    pub(crate) config: TransportConfig,
    pub(crate) buffers: BufferPool,
    pub(crate) groups: PacketGroupPool,
    pub(crate) compressor: Option<Arc<dyn Compressor>>,
    pub(crate) cipher_factory: Option<Arc<dyn CipherFactory>>,
    pub(crate) protocol: Arc<dyn Protocol<S>>,
    pub(crate) outgoing: Vec<SwapQueue<OutgoingMessage<S>>>,
    pub(crate) incoming: SwapQueue<IncomingMessage<S>>,
    pub(crate) connections: Mutex<HashMap<ConnectionId, Arc<Connection<S>>>>,
    pub(crate) runtime: tokio::runtime::Handle,
    pub(crate) stop: AtomicBool,
    next_id: AtomicU32,
}

impl<S> EngineShared<S> {
    pub(crate) fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Counters for one [`TransportEngine::cycle`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Packets handed to their handler.
    pub handled: usize,
    /// Handlers that returned an error.
    pub handler_errors: usize,
    /// Packets dropped because their connection closed first.
    pub dropped: usize,
    /// Connections whose close was processed.
    pub closed: usize,
}

/// Builder for a [`TransportEngine`].
pub struct TransportBuilder<S> {
    config: TransportConfig,
    protocol: Arc<dyn Protocol<S>>,
    compressor: Option<Arc<dyn Compressor>>,
    cipher_factory: Option<Arc<dyn CipherFactory>>,
}

impl<S: ConnectionState> TransportBuilder<S> {
    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Compresses every outgoing group and decompresses every incoming stream.
    #[must_use]
    pub fn compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    /// Gives every new connection a cipher awaiting its handshake.
    #[must_use]
    pub fn cipher_factory(mut self, factory: Arc<dyn CipherFactory>) -> Self {
        self.cipher_factory = Some(factory);
        self
    }

    /// Starts the I/O runtime and the sender threads.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the runtime or a thread cannot start.
    pub fn build(self) -> TransportResult<TransportEngine<S>> {
        let config = self.config;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.io_threads.max(1))
            .thread_name("shardsync-io")
            .enable_io()
            .enable_time()
            .build()?;

        let buffers = BufferPool::new(config.buffer_len, config.max_idle_buffers);
        let lanes = config.sender_threads.max(1);
        let shared = Arc::new(EngineShared {
            groups: PacketGroupPool::new(buffers.clone()),
            buffers,
            compressor: self.compressor,
            cipher_factory: self.cipher_factory,
            protocol: self.protocol,
            outgoing: (0..lanes).map(|_| SwapQueue::with_capacity(256)).collect(),
            incoming: SwapQueue::with_capacity(256),
            connections: Mutex::new(HashMap::new()),
            runtime: runtime.handle().clone(),
            stop: AtomicBool::new(false),
            next_id: AtomicU32::new(1),
            config,
        });

        let mut engine = TransportEngine {
            shared: Arc::clone(&shared),
            runtime: Some(runtime),
            senders: Vec::with_capacity(lanes),
            listeners: Vec::new(),
            drained: Vec::with_capacity(256),
        };

        for lane in 0..lanes {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("shardsync-sender-{lane}"))
                .spawn(move || sender::run(shared, lane))?;
            engine.senders.push(handle);
        }

        tracing::info!(
            sender_threads = lanes,
            io_threads = shared.config.io_threads.max(1),
            buffer_len = shared.config.buffer_len,
            compression = shared.compressor.is_some(),
            encryption = shared.cipher_factory.is_some(),
            "transport engine started"
        );
        Ok(engine)
    }
}

/// Owns the socket runtime, the sender threads and every connection.
pub struct TransportEngine<S: ConnectionState> {
    shared: Arc<EngineShared<S>>,
    runtime: Option<tokio::runtime::Runtime>,
    senders: Vec<std::thread::JoinHandle<()>>,
    listeners: Vec<tokio::task::JoinHandle<()>>,
    drained: Vec<IncomingMessage<S>>,
}

impl<S: ConnectionState> TransportEngine<S> {
    /// Starts building an engine that decodes with `protocol`.
    #[must_use]
    pub fn builder(protocol: Arc<dyn Protocol<S>>) -> TransportBuilder<S> {
        TransportBuilder {
            config: TransportConfig::default(),
            protocol,
            compressor: None,
            cipher_factory: None,
        }
    }

    /// Dispatches every decoded packet and processed close to the sessions.
    ///
    /// Call once per tick from the game-logic thread. Handler errors are
    /// logged and do not stop the loop.
    pub fn cycle(&mut self) -> CycleStats {
        let mut stats = CycleStats::default();
        self.shared.incoming.swap_into(&mut self.drained);

        for message in self.drained.drain(..) {
            match message {
                IncomingMessage::Packet { conn, id, mut packet } => {
                    if conn.is_closed() {
                        stats.dropped += 1;
                    } else {
                        let mut state = conn.state();
                        match packet.handle(&conn, &mut state) {
                            Ok(()) => stats.handled += 1,
                            Err(e) => {
                                stats.handler_errors += 1;
                                tracing::warn!(conn = %conn.id(), error = %e, "packet handler failed");
                            }
                        }
                    }
                    self.shared.protocol.recycle(id, packet);
                }
                IncomingMessage::Closed { conn, reason } => {
                    conn.state().on_close(&reason);
                    self.shared.connections.lock().remove(&conn.id());
                    stats.closed += 1;
                }
            }
        }

        stats
    }

    /// Looks up a live connection.
    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection<S>>> {
        self.shared.connections.lock().get(&id).cloned()
    }

    /// Returns the number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().len()
    }

    /// Returns the ids of every registered connection, in ascending order.
    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.shared.connections.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Returns the packet group pool shared with the sync layer.
    #[must_use]
    pub fn groups(&self) -> &PacketGroupPool {
        &self.shared.groups
    }

    /// Returns the buffer pool.
    #[must_use]
    pub fn buffers(&self) -> &BufferPool {
        &self.shared.buffers
    }

    /// Returns the configuration the engine was built with.
    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    /// Returns the number of sends waiting for a sender thread.
    #[must_use]
    pub fn pending_sends(&self) -> usize {
        self.shared.outgoing.iter().map(SwapQueue::len).sum()
    }

    fn runtime(&self) -> TransportResult<&tokio::runtime::Runtime> {
        match &self.runtime {
            Some(rt) if !self.shared.stop.load(Ordering::Acquire) => Ok(rt),
            _ => Err(TransportError::ShutDown),
        }
    }

    /// Stops the sender threads, closes every connection and stops the runtime.
    ///
    /// Sessions receive `on_close("server shutdown")` before this returns.
    pub fn shutdown(&mut self) {
        if self.shared.stop.swap(true, Ordering::AcqRel) {
            return;
        }

        for lane in &self.shared.outgoing {
            lane.wake();
        }
        for handle in self.senders.drain(..) {
            if handle.join().is_err() {
                tracing::error!("sender thread panicked");
            }
        }
        for task in self.listeners.drain(..) {
            task.abort();
        }

        let open: Vec<_> = self.shared.connections.lock().values().cloned().collect();
        for conn in open {
            conn.close("server shutdown");
        }
        let stats = self.cycle();
        self.shared.connections.lock().clear();

        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
        }
        tracing::info!(closed = stats.closed, "transport engine stopped");
    }
}

impl<S: ConnectionState> Drop for TransportEngine<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<S: ConnectionState> std::fmt::Debug for TransportEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportEngine")
            .field("config", &self.shared.config)
            .field("connections", &self.connection_count())
            .field("senders", &self.senders.len())
            .finish_non_exhaustive()
    }
}
