//! # Fan-out Helpers
//!
//! One flush pass builds each shared packet at most once per viewer
//! variant and sends the same group to every matching observer:
//!
//! ```text
//!   observer A (Innocent) ──┐
//!   observer B (Innocent) ──┼──► VariantCache[Innocent] ──► one group, one compression
//!   observer C (Murderer) ──┴──► VariantCache[Murderer] ──► one group, one compression
//! ```
//!
//! Groups are multi-use and are disposed when their holder drops at the end
//! of the pass.

use shardsync_core::SanityResult;
use shardsync_net::{GroupMode, OutgoingPacket, PacketGroup, PacketGroupPool, PacketSink};

use crate::world::Highlight;

/// Counters reported by one flush pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Entities taken off the queue and processed.
    pub entities: usize,
    /// Entities skipped because they were deleted or missing.
    pub skipped: usize,
    /// Packet groups built.
    pub groups_built: usize,
    /// Group sends handed to sessions.
    pub sends: usize,
}

impl std::ops::AddAssign for FlushStats {
    fn add_assign(&mut self, other: Self) {
        self.entities += other.entities;
        self.skipped += other.skipped;
        self.groups_built += other.groups_built;
        self.sends += other.sends;
    }
}

/// Builds groups from the shared pool and counts what a pass does.
pub(crate) struct Fanout<'a> {
    groups: &'a PacketGroupPool,
    pub(crate) stats: FlushStats,
}

impl<'a> Fanout<'a> {
    pub(crate) fn new(groups: &'a PacketGroupPool) -> Self {
        Self {
            groups,
            stats: FlushStats::default(),
        }
    }

    pub(crate) fn build(&mut self, mode: GroupMode, packet: &dyn OutgoingPacket) -> SanityResult<PacketGroup> {
        let group = self.groups.with_packet(mode, packet)?;
        self.stats.groups_built += 1;
        Ok(group)
    }

    /// Starts an empty single-use group for packets added one by one.
    pub(crate) fn single_use(&mut self) -> PacketGroup {
        self.stats.groups_built += 1;
        self.groups.single_use()
    }

    pub(crate) fn send(&mut self, sink: &dyn PacketSink, group: &PacketGroup) {
        sink.send_packet_group(group);
        self.stats.sends += 1;
    }

    /// Wraps `packet` in a single-use group and sends it.
    pub(crate) fn send_single(&mut self, sink: &dyn PacketSink, packet: &dyn OutgoingPacket) -> SanityResult<()> {
        let group = self.build(GroupMode::SingleUse, packet)?;
        self.send(sink, &group);
        Ok(())
    }
}

/// A multi-use group built on first use within a pass.
#[derive(Default)]
pub(crate) struct SharedGroup {
    group: Option<PacketGroup>,
}

impl SharedGroup {
    pub(crate) fn send<P, F>(&mut self, out: &mut Fanout<'_>, sink: &dyn PacketSink, build: F) -> SanityResult<()>
    where
        P: OutgoingPacket,
        F: FnOnce() -> P,
    {
        if self.group.is_none() {
            self.group = Some(out.build(GroupMode::MultiUse, &build())?);
        }
        if let Some(group) = &self.group {
            out.send(sink, group);
        }
        Ok(())
    }
}

impl Drop for SharedGroup {
    fn drop(&mut self) {
        if let Some(group) = self.group.take() {
            group.dispose();
        }
    }
}

/// One [`SharedGroup`] per highlight variant.
#[derive(Default)]
pub(crate) struct VariantCache {
    variants: [SharedGroup; Highlight::COUNT],
}

impl VariantCache {
    pub(crate) fn send<P, F>(
        &mut self,
        out: &mut Fanout<'_>,
        sink: &dyn PacketSink,
        highlight: Highlight,
        build: F,
    ) -> SanityResult<()>
    where
        P: OutgoingPacket,
        F: FnOnce(Highlight) -> P,
    {
        self.variants[highlight.index()].send(out, sink, || build(highlight))
    }
}
