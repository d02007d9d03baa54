//! # Packet Groups
//!
//! A packet group is a batch of serialized packets that is compressed once
//! and then sent to any number of connections.
//!
//! ## Lifecycle
//!
//! ```text
//!  Building ──seal──► Written ──finalize──► Compressed ──► Disposed
//!     │ add_packet       (first send)      (compress once)     │
//!     └──────────────────────────────────────────────────────-─┘
//!                     scratch buffers go back to the pool
//! ```
//!
//! ## Modes
//!
//! | Mode        | Disposal                                                 |
//! |-------------|----------------------------------------------------------|
//! | `SingleUse` | automatic, when the last in-flight send completes         |
//! | `MultiUse`  | explicit [`PacketGroup::dispose`], deferred while in flight |
//! | `Cached`    | never; bytes move to an owned slice on first finalize      |
//!
//! ## Recycling
//!
//! When the last handle to a group is dropped, the group goes back to the
//! idle list of the pool that built it, with its buffers returned and its
//! packet list cleared. The next acquire reuses it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{RwLock, RwLockUpgradableReadGuard, RwLockWriteGuard};
use shardsync_core::{ensure, Buffer, BufferPool, Pool, Poolable, SanityResult, SanityViolation};

use super::codec::Compressor;
use super::packet::{write_packet, OutgoingPacket};
use crate::error::CodecError;

/// Idle groups kept by a pool unless configured otherwise.
pub const DEFAULT_IDLE_GROUPS: usize = 256;

/// How a packet group is disposed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GroupMode {
    /// Disposed automatically once every send has completed.
    SingleUse,
    /// Shared across observers within one flush, disposed explicitly.
    MultiUse,
    /// Built once and reused for the lifetime of the process.
    Cached,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Building,
    Written,
    Compressed,
    Disposed,
}

struct GroupState {
    phase: Phase,
    uncompressed: Option<Buffer>,
    compressed: Option<Buffer>,
    cached: Option<Box<[u8]>>,
    packet_ids: Vec<u8>,
}

impl GroupState {
    fn final_bytes(&self) -> &[u8] {
        if let Some(bytes) = &self.cached {
            return bytes;
        }
        match (&self.compressed, &self.uncompressed) {
            (Some(buf), _) | (None, Some(buf)) => buf.as_slice(),
            (None, None) => &[],
        }
    }
}

/// Counters shared by every group built from one pool.
#[derive(Debug, Default)]
struct GroupStats {
    built: AtomicUsize,
    disposed: AtomicUsize,
}

struct GroupInner {
    mode: GroupMode,
    buffers: BufferPool,
    stats: Arc<GroupStats>,
    home: Weak<Pool<Recycled>>,
    state: RwLock<GroupState>,
    sealed: AtomicBool,
    in_flight: AtomicUsize,
    sends: AtomicUsize,
    dispose_requested: AtomicBool,
    disposed: AtomicBool,
    compression_passes: AtomicUsize,
}

impl GroupInner {
    fn new(buffers: BufferPool, stats: Arc<GroupStats>, home: Weak<Pool<Recycled>>) -> Self {
        Self {
            mode: GroupMode::SingleUse,
            buffers,
            stats,
            home,
            state: RwLock::new(GroupState {
                phase: Phase::Building,
                uncompressed: None,
                compressed: None,
                cached: None,
                packet_ids: Vec::new(),
            }),
            sealed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            sends: AtomicUsize::new(0),
            dispose_requested: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            compression_passes: AtomicUsize::new(0),
        }
    }
}

/// An unshared group waiting in a pool's idle list.
struct Recycled(Arc<GroupInner>);

impl Poolable for Recycled {
    fn reset(&mut self) {
        // Only unshared groups are released.
        let Some(inner) = Arc::get_mut(&mut self.0) else {
            return;
        };
        let state = inner.state.get_mut();
        for buf in [state.uncompressed.take(), state.compressed.take()].into_iter().flatten() {
            inner.buffers.release(buf);
        }
        state.phase = Phase::Building;
        state.cached = None;
        state.packet_ids.clear();

        *inner.sealed.get_mut() = false;
        *inner.in_flight.get_mut() = 0;
        *inner.sends.get_mut() = 0;
        *inner.dispose_requested.get_mut() = false;
        *inner.disposed.get_mut() = false;
        *inner.compression_passes.get_mut() = 0;
    }
}

/// Shared handle to a packet group.
///
/// Cloning is cheap; every clone refers to the same group. Dropping the last
/// clone recycles the group.
#[derive(Clone)]
pub struct PacketGroup {
    inner: Option<Arc<GroupInner>>,
}

impl PacketGroup {
    #[inline]
    fn inner(&self) -> &GroupInner {
        self.inner.as_deref().unwrap_or_else(|| unreachable!("group taken before drop"))
    }

    /// Returns the disposal mode.
    #[inline]
    #[must_use]
    pub fn mode(&self) -> GroupMode {
        self.inner().mode
    }

    /// Serializes `packet` onto the end of the group.
    ///
    /// # Errors
    ///
    /// Returns a [`SanityViolation`] if the group was already sent or disposed.
    pub fn add_packet(&self, packet: &dyn OutgoingPacket) -> SanityResult<()> {
        ensure(!self.inner().sealed.load(Ordering::Acquire), "packet group", || {
            format!("adding packet {:#04x} to a sealed group", packet.id())
        })?;

        let mut state = self.inner().state.write();
        ensure(state.phase == Phase::Building, "packet group", || {
            format!("adding packet {:#04x} in phase {:?}", packet.id(), state.phase)
        })?;

        let buffers = &self.inner().buffers;
        let scratch = state.uncompressed.get_or_insert_with(|| buffers.acquire());
        write_packet(packet, scratch.as_mut_vec())?;
        state.packet_ids.push(packet.id());
        Ok(())
    }

    /// Returns true if no packet has been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner().state.read().packet_ids.is_empty()
    }

    /// Returns the number of packets in the group.
    #[must_use]
    pub fn packet_count(&self) -> usize {
        self.inner().state.read().packet_ids.len()
    }

    /// Returns the type bytes of the packets in order.
    #[must_use]
    pub fn packet_ids(&self) -> Vec<u8> {
        self.inner().state.read().packet_ids.clone()
    }

    /// Copies the uncompressed bytes, if they are still held.
    ///
    /// Cached groups drop their uncompressed form after finalizing.
    #[must_use]
    pub fn copy_uncompressed(&self) -> Option<Vec<u8>> {
        let state = self.inner().state.read();
        state.uncompressed.as_ref().map(|b| b.as_slice().to_vec())
    }

    /// Returns how many times compression ran for this group.
    #[inline]
    #[must_use]
    pub fn compression_passes(&self) -> usize {
        self.inner().compression_passes.load(Ordering::Acquire)
    }

    /// Returns how many sends were started.
    #[inline]
    #[must_use]
    pub fn send_count(&self) -> usize {
        self.inner().sends.load(Ordering::Acquire)
    }

    /// Returns the number of sends not yet completed.
    #[inline]
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner().in_flight.load(Ordering::Acquire)
    }

    /// Returns true once the group's buffers went back to the pool.
    #[inline]
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner().disposed.load(Ordering::Acquire)
    }

    /// Returns true if both handles refer to the same group.
    #[inline]
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        std::ptr::eq(a.inner(), b.inner())
    }

    /// Seals the group and registers one in-flight send.
    ///
    /// The returned ticket completes the send when dropped.
    ///
    /// # Errors
    ///
    /// Returns a [`SanityViolation`] if the group was disposed.
    pub fn begin_send(&self) -> SanityResult<SendTicket> {
        ensure(!self.inner().disposed.load(Ordering::Acquire), "packet group", || {
            format!("sending a disposed {:?} group", self.inner().mode)
        })?;
        self.inner().sealed.store(true, Ordering::Release);
        self.inner().in_flight.fetch_add(1, Ordering::AcqRel);
        self.inner().sends.fetch_add(1, Ordering::AcqRel);
        Ok(SendTicket {
            group: Some(self.clone()),
        })
    }

    /// Runs `f` on the bytes that go on the wire.
    ///
    /// The first call compresses the group (if a compressor is given); every
    /// later call reuses the result. Cached groups move their bytes into an
    /// owned slice and return their scratch buffers on that first call.
    ///
    /// # Errors
    ///
    /// Returns a [`SanityViolation`] (as [`GroupError::Sanity`]) if the
    /// group was disposed, or a [`CodecError`] if compression failed.
    pub fn with_final_bytes<R>(
        &self,
        compressor: Option<&dyn Compressor>,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, GroupError> {
        let state = self.inner().state.upgradable_read();
        match state.phase {
            Phase::Compressed => return Ok(f(state.final_bytes())),
            Phase::Disposed => {
                return Err(SanityViolation::new(
                    "packet group",
                    format!("reading final bytes of a disposed {:?} group", self.inner().mode),
                )
                .into());
            }
            Phase::Building | Phase::Written => {}
        }

        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        self.finalize(&mut state, compressor)?;
        let state = RwLockWriteGuard::downgrade(state);
        Ok(f(state.final_bytes()))
    }

    fn finalize(&self, state: &mut GroupState, compressor: Option<&dyn Compressor>) -> Result<(), GroupError> {
        self.inner().sealed.store(true, Ordering::Release);
        state.phase = Phase::Written;

        if let Some(compressor) = compressor {
            let mut out = self.inner().buffers.acquire();
            let input = state.uncompressed.as_ref().map_or(&[][..], Buffer::as_slice);
            if let Err(e) = compressor.compress(input, out.as_mut_vec()) {
                self.inner().buffers.release(out);
                return Err(e.into());
            }
            state.compressed = Some(out);
        }
        self.inner().compression_passes.fetch_add(1, Ordering::AcqRel);
        state.phase = Phase::Compressed;

        if self.inner().mode == GroupMode::Cached {
            state.cached = Some(match (&state.compressed, &state.uncompressed) {
                (Some(buf), _) | (None, Some(buf)) => buf.to_boxed(),
                (None, None) => Box::default(),
            });
            self.release_scratch(state);
            tracing::debug!(
                packets = state.packet_ids.len(),
                bytes = state.final_bytes().len(),
                "cached packet group finalized"
            );
        }
        Ok(())
    }

    /// Disposes a multi-use group once no send is in flight.
    ///
    /// Calling it while sends are in flight defers disposal to the last
    /// completion. A single-use group that was never sent is disposed
    /// immediately. Cached groups ignore the call.
    pub fn dispose(&self) {
        match self.inner().mode {
            GroupMode::Cached => {}
            GroupMode::SingleUse if self.send_count() > 0 => {}
            GroupMode::SingleUse | GroupMode::MultiUse => {
                self.inner().dispose_requested.store(true, Ordering::SeqCst);
                if self.inner().in_flight.load(Ordering::SeqCst) == 0 {
                    self.dispose_now();
                }
            }
        }
    }

    fn complete_send(&self) {
        let previous = self.inner().in_flight.fetch_sub(1, Ordering::SeqCst);
        if previous != 1 {
            return;
        }
        match self.inner().mode {
            GroupMode::SingleUse => self.dispose_now(),
            GroupMode::MultiUse if self.inner().dispose_requested.load(Ordering::SeqCst) => self.dispose_now(),
            GroupMode::MultiUse | GroupMode::Cached => {}
        }
    }

    fn dispose_now(&self) {
        if self.inner().disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.inner().state.write();
        self.release_scratch(&mut state);
        state.phase = Phase::Disposed;
        self.inner().stats.disposed.fetch_add(1, Ordering::Relaxed);
    }

    fn release_scratch(&self, state: &mut GroupState) {
        if let Some(buf) = state.uncompressed.take() {
            self.inner().buffers.release(buf);
        }
        if let Some(buf) = state.compressed.take() {
            self.inner().buffers.release(buf);
        }
    }
}

impl std::fmt::Debug for PacketGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketGroup")
            .field("mode", &self.inner().mode)
            .field("in_flight", &self.in_flight())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl Drop for PacketGroup {
    fn drop(&mut self) {
        let Some(mut inner) = self.inner.take() else {
            return;
        };
        if Arc::get_mut(&mut inner).is_none() {
            return;
        }
        let home = inner.home.upgrade();
        if let Some(home) = home {
            home.release(Recycled(inner));
        }
    }
}

impl Drop for GroupInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(buf) = state.uncompressed.take() {
            self.buffers.release(buf);
        }
        if let Some(buf) = state.compressed.take() {
            self.buffers.release(buf);
        }
    }
}

/// Errors from [`PacketGroup::with_final_bytes`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GroupError {
    /// The group was misused.
    #[error(transparent)]
    Sanity(#[from] SanityViolation),
    /// Compression failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// One in-flight send of a packet group.
///
/// Dropping the ticket completes the send, whether the write succeeded,
/// failed, or was abandoned because the connection closed.
#[derive(Debug)]
pub struct SendTicket {
    group: Option<PacketGroup>,
}

impl SendTicket {
    /// Returns the group being sent.
    ///
    /// # Panics
    ///
    /// Never; the group is only taken in `drop`.
    #[must_use]
    pub fn group(&self) -> &PacketGroup {
        self.group.as_ref().unwrap_or_else(|| unreachable!("ticket group taken before drop"))
    }
}

impl Drop for SendTicket {
    fn drop(&mut self) {
        if let Some(group) = self.group.take() {
            group.complete_send();
        }
    }
}

/// Builds packet groups whose scratch buffers come from one buffer pool,
/// and recycles the groups once their last handle is dropped.
#[derive(Clone)]
pub struct PacketGroupPool {
    buffers: BufferPool,
    stats: Arc<GroupStats>,
    idle: Arc<Pool<Recycled>>,
}

impl PacketGroupPool {
    /// Creates a group pool over `buffers` keeping [`DEFAULT_IDLE_GROUPS`].
    #[must_use]
    pub fn new(buffers: BufferPool) -> Self {
        Self::with_max_idle(buffers, DEFAULT_IDLE_GROUPS)
    }

    /// Creates a group pool over `buffers` keeping up to `max_idle` groups.
    #[must_use]
    pub fn with_max_idle(buffers: BufferPool, max_idle: usize) -> Self {
        let stats = Arc::new(GroupStats::default());
        let idle = Arc::new_cyclic(|home: &Weak<Pool<Recycled>>| {
            let (buffers, stats, home) = (buffers.clone(), Arc::clone(&stats), home.clone());
            Pool::new(max_idle, move || {
                Recycled(Arc::new(GroupInner::new(buffers.clone(), Arc::clone(&stats), home.clone())))
            })
        });
        Self { buffers, stats, idle }
    }

    /// Starts a group in the given mode, reusing an idle one if possible.
    #[must_use]
    pub fn acquire(&self, mode: GroupMode) -> PacketGroup {
        self.stats.built.fetch_add(1, Ordering::Relaxed);
        let Recycled(mut inner) = self.idle.acquire();
        if let Some(fresh) = Arc::get_mut(&mut inner) {
            fresh.mode = mode;
        }
        PacketGroup { inner: Some(inner) }
    }

    /// Starts a single-use group.
    #[inline]
    #[must_use]
    pub fn single_use(&self) -> PacketGroup {
        self.acquire(GroupMode::SingleUse)
    }

    /// Starts a multi-use group.
    #[inline]
    #[must_use]
    pub fn multi_use(&self) -> PacketGroup {
        self.acquire(GroupMode::MultiUse)
    }

    /// Starts a permanently cached group.
    #[inline]
    #[must_use]
    pub fn cached(&self) -> PacketGroup {
        self.acquire(GroupMode::Cached)
    }

    /// Wraps one packet in a fresh group.
    ///
    /// # Errors
    ///
    /// Never fails on a fresh group; the signature mirrors [`PacketGroup::add_packet`].
    pub fn with_packet(&self, mode: GroupMode, packet: &dyn OutgoingPacket) -> SanityResult<PacketGroup> {
        let group = self.acquire(mode);
        group.add_packet(packet)?;
        Ok(group)
    }

    /// Returns the buffer pool backing the groups.
    #[inline]
    #[must_use]
    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    /// Returns how many groups were built.
    #[must_use]
    pub fn built_count(&self) -> usize {
        self.stats.built.load(Ordering::Relaxed)
    }

    /// Returns how many groups were disposed.
    #[must_use]
    pub fn disposed_count(&self) -> usize {
        self.stats.disposed.load(Ordering::Relaxed)
    }

    /// Returns how many group allocations were made; recycled groups are
    /// not counted again.
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.idle.created_count()
    }

    /// Returns the number of groups waiting for reuse.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.idle_count()
    }
}

impl std::fmt::Debug for PacketGroupPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketGroupPool")
            .field("built", &self.built_count())
            .field("allocated", &self.allocated_count())
            .field("idle", &self.idle_count())
            .finish_non_exhaustive()
    }
}

impl Default for PacketGroupPool {
    fn default() -> Self {
        Self::new(BufferPool::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::Lz4Compressor;
    use crate::protocol::packet::PacketWriter;

    struct Blob(u8, usize);

    impl OutgoingPacket for Blob {
        fn id(&self) -> u8 {
            self.0
        }
        fn write_body(&self, writer: &mut PacketWriter<'_>) {
            for i in 0..self.1 {
                writer.write_u8((i % 5) as u8);
            }
        }
    }

    fn pool() -> PacketGroupPool {
        PacketGroupPool::new(BufferPool::new(256, 16))
    }

    #[test]
    fn test_multi_use_compresses_once() {
        let pool = pool();
        let group = pool.multi_use();
        group.add_packet(&Blob(0x78, 300)).unwrap();

        let mut sizes = Vec::new();
        for _ in 0..50 {
            let ticket = group.begin_send().unwrap();
            let len = ticket
                .group()
                .with_final_bytes(Some(&Lz4Compressor), <[u8]>::len)
                .unwrap();
            sizes.push(len);
        }

        assert_eq!(group.compression_passes(), 1);
        assert!(sizes.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(group.in_flight(), 0);
        assert!(!group.is_disposed());

        group.dispose();
        assert!(group.is_disposed());
        assert_eq!(pool.buffers().outstanding(), 0);
    }

    #[test]
    fn test_single_use_disposes_exactly_once() {
        let pool = pool();
        let group = pool.single_use();
        group.add_packet(&Blob(0x1d, 4)).unwrap();

        let a = group.begin_send().unwrap();
        let b = group.begin_send().unwrap();
        drop(a);
        assert!(!group.is_disposed());
        drop(b);
        assert!(group.is_disposed());

        // Late calls do not dispose a second time.
        group.dispose();
        assert_eq!(pool.disposed_count(), 1);
        assert!(group.begin_send().is_err());
    }

    #[test]
    fn test_multi_use_dispose_waits_for_in_flight() {
        let pool = pool();
        let group = pool.multi_use();
        group.add_packet(&Blob(0x77, 8)).unwrap();

        let ticket = group.begin_send().unwrap();
        group.dispose();
        assert!(!group.is_disposed());

        drop(ticket);
        assert!(group.is_disposed());
        assert_eq!(pool.disposed_count(), 1);
    }

    #[test]
    fn test_cached_group_owns_its_bytes() {
        let pool = pool();
        let group = pool.cached();
        group.add_packet(&Blob(0x72, 5)).unwrap();

        let first = group.with_final_bytes(None, <[u8]>::to_vec).unwrap();
        assert_eq!(first, vec![0x72, 0, 1, 2, 3, 4]);
        assert_eq!(pool.buffers().outstanding(), 0);
        assert!(group.copy_uncompressed().is_none());

        group.dispose();
        assert!(!group.is_disposed());
        let again = group.with_final_bytes(None, <[u8]>::to_vec).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn test_sealed_group_rejects_packets() {
        let pool = pool();
        let group = pool.multi_use();
        group.add_packet(&Blob(0x20, 1)).unwrap();
        let _ticket = group.begin_send().unwrap();

        let err = group.add_packet(&Blob(0x20, 1)).unwrap_err();
        assert_eq!(err.context, "packet group");
        assert_eq!(group.packet_ids(), vec![0x20]);
    }

    #[test]
    fn test_dropped_group_is_recycled() {
        let pool = pool();
        for round in 0..20u8 {
            let group = pool.single_use();
            assert!(group.is_empty());
            assert_eq!(group.send_count(), 0);
            assert!(!group.is_disposed());

            group.add_packet(&Blob(round, 8)).unwrap();
            let ticket = group.begin_send().unwrap();
            assert_eq!(ticket.group().with_final_bytes(None, <[u8]>::len).unwrap(), 9);
            drop(group);
            drop(ticket);
        }

        assert_eq!(pool.built_count(), 20);
        assert_eq!(pool.allocated_count(), 1);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.buffers().outstanding(), 0);

        let reused = pool.multi_use();
        assert_eq!(reused.mode(), GroupMode::MultiUse);
        assert_eq!(reused.compression_passes(), 0);
        reused.add_packet(&Blob(0x30, 1)).unwrap();
        assert_eq!(reused.packet_ids(), vec![0x30]);
    }

    #[test]
    fn test_shared_group_is_recycled_by_last_handle() {
        let pool = pool();
        let group = pool.multi_use();
        let other = group.clone();
        drop(group);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(other.mode(), GroupMode::MultiUse);

        drop(other);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_dropped_group_returns_buffers() {
        let pool = pool();
        {
            let group = pool.multi_use();
            group.add_packet(&Blob(0x11, 10)).unwrap();
            assert_eq!(pool.buffers().outstanding(), 1);
        }
        assert_eq!(pool.buffers().outstanding(), 0);
    }
}
