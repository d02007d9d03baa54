//! # Shard Runtime
//!
//! Owns the transport engine and both sync queues. The queues build their
//! groups from the engine's pool, so every group they fan out goes back to
//! the same buffers once the sender threads are done with it.

use std::net::SocketAddr;
use std::sync::Arc;

use shardsync_net::{ConnectionState, CycleStats, Lz4Compressor, Protocol, Server, TransportEngine};
use shardsync_sync::{CharSyncQueue, FlushStats, ItemSyncQueue, SyncConfig, SyncWorld};

use crate::config::ShardConfig;
use crate::error::RuntimeResult;

/// What one tick did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Incoming dispatch.
    pub cycle: CycleStats,
    /// Character flush.
    pub chars: FlushStats,
    /// Item flush.
    pub items: FlushStats,
}

/// Transport plus sync queues for one shard.
pub struct ShardRuntime<S: ConnectionState> {
    engine: TransportEngine<S>,
    chars: CharSyncQueue,
    items: ItemSyncQueue,
    ticks: u64,
}

impl<S: ConnectionState> ShardRuntime<S> {
    /// Wraps a running engine.
    ///
    /// # Errors
    ///
    /// Returns a sync error if the prepared groups cannot be built.
    pub fn new(engine: TransportEngine<S>, sync: SyncConfig) -> RuntimeResult<Self> {
        let groups = engine.groups().clone();
        let chars = CharSyncQueue::new(groups.clone(), sync.clone())?;
        let items = ItemSyncQueue::new(groups, sync);
        Ok(Self {
            engine,
            chars,
            items,
            ticks: 0,
        })
    }

    /// Validates `config` and starts an engine for it.
    ///
    /// # Errors
    ///
    /// Returns a config error for invalid settings or a transport error if
    /// the engine threads cannot start.
    pub fn from_config(protocol: Arc<dyn Protocol<S>>, config: &ShardConfig) -> RuntimeResult<Self> {
        config.validate()?;
        let mut builder = TransportEngine::builder(protocol).config(config.transport.clone());
        if config.compression {
            builder = builder.compressor(Arc::new(Lz4Compressor));
        }
        let engine = builder.build()?;
        tracing::info!(
            tick_rate = config.tick_rate,
            sender_threads = config.transport.sender_threads,
            compression = config.compression,
            "shard runtime started"
        );
        Self::new(engine, config.sync.clone())
    }

    /// Starts the server role on `addr`.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the bind fails.
    pub fn listen(&mut self, addr: SocketAddr) -> RuntimeResult<Server> {
        Ok(self.engine.listen(addr)?)
    }

    /// Dispatches decoded packets to their handlers.
    pub fn cycle(&mut self) -> CycleStats {
        self.engine.cycle()
    }

    /// Flushes characters, then items.
    ///
    /// # Errors
    ///
    /// Returns the first flush abort; whatever that queue had not reached
    /// yet stays pending for the next call.
    pub fn flush(&self, world: &dyn SyncWorld) -> RuntimeResult<(FlushStats, FlushStats)> {
        let chars = self.chars.flush(world)?;
        let items = self.items.flush(world)?;
        Ok((chars, items))
    }

    /// One full tick: dispatch, game logic, flush.
    ///
    /// `update` runs between dispatch and flush and is where the world is
    /// mutated and the queues' hooks are called.
    ///
    /// # Errors
    ///
    /// As [`ShardRuntime::flush`].
    pub fn tick<W, F>(&mut self, world: &mut W, update: F) -> RuntimeResult<TickReport>
    where
        W: SyncWorld,
        F: FnOnce(&mut W, &CharSyncQueue, &ItemSyncQueue),
    {
        self.ticks += 1;
        let cycle = self.cycle();
        update(world, &self.chars, &self.items);
        let (chars, items) = self.flush(world)?;

        if chars.sends + items.sends > 0 || cycle.handled > 0 {
            tracing::trace!(
                tick = self.ticks,
                handled = cycle.handled,
                char_sends = chars.sends,
                item_sends = items.sends,
                "tick"
            );
        }
        Ok(TickReport { cycle, chars, items })
    }

    /// Ticks run so far.
    #[must_use]
    pub const fn tick_count(&self) -> u64 {
        self.ticks
    }

    /// The transport engine.
    #[must_use]
    pub fn engine(&self) -> &TransportEngine<S> {
        &self.engine
    }

    /// The transport engine, mutably.
    pub fn engine_mut(&mut self) -> &mut TransportEngine<S> {
        &mut self.engine
    }

    /// The character queue.
    #[must_use]
    pub fn chars(&self) -> &CharSyncQueue {
        &self.chars
    }

    /// The item queue.
    #[must_use]
    pub fn items(&self) -> &ItemSyncQueue {
        &self.items
    }

    /// Disables both queues and shuts the engine down.
    pub fn shutdown(&mut self) {
        self.chars.set_enabled(false);
        self.items.set_enabled(false);
        self.engine.shutdown();
        tracing::info!(ticks = self.ticks, "shard runtime stopped");
    }
}

impl<S: ConnectionState> std::fmt::Debug for ShardRuntime<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardRuntime")
            .field("engine", &self.engine)
            .field("ticks", &self.ticks)
            .finish_non_exhaustive()
    }
}
