//! # Item Sync Queue
//!
//! Items carry no snapshots: any mark simply resends the item where it is
//! now. Recipients depend on the location:
//!
//! | Location            | Recipients                          | Packet            |
//! |---------------------|-------------------------------------|-------------------|
//! | ground              | players in range                    | `GroundItem`      |
//! | worn, visible layer | players in range of the wearer      | `WornItem`        |
//! | in a container      | players with the container open     | `ContainerItem`   |
//!
//! A properties-only mark sends just the property revision.

use shardsync_core::{ensure, Poolable, SanityResult};
use shardsync_net::{PacketGroupPool, PacketSink};

use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::fanout::{Fanout, FlushStats, SharedGroup};
use crate::packets::{ContainerItem, GroundItem, PropertiesRevision, WornItem};
use crate::queue::{ChangeRecord, ChangeTable};
use crate::world::{EntityId, ItemLocation, ItemView, Point4, Sightline, SyncWorld, SENT_LAYERS};

/// Pending sync work of one item.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ItemSyncFlags(u8);

impl ItemSyncFlags {
    /// Complete update, after creation or on demand.
    pub const RESEND: Self = Self(0x01);
    /// The item changed.
    pub const UPDATE: Self = Self(0x02);
    /// The property list changed.
    pub const PROPERTIES: Self = Self(0x04);

    /// No pending work.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns true if nothing is set.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if any bit of `other` is set.
    #[inline]
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns the union.
    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Pooled record of one item's pending flags.
#[derive(Debug, Default)]
pub struct ItemChangeState {
    entity: EntityId,
    flags: ItemSyncFlags,
}

impl ItemChangeState {
    /// Flags accumulated since the last flush.
    #[must_use]
    pub const fn flags(&self) -> ItemSyncFlags {
        self.flags
    }
}

impl Poolable for ItemChangeState {
    fn reset(&mut self) {
        self.entity = EntityId::default();
        self.flags = ItemSyncFlags::empty();
    }
}

impl ChangeRecord for ItemChangeState {
    fn entity(&self) -> EntityId {
        self.entity
    }

    fn bind(&mut self, id: EntityId) {
        self.entity = id;
    }
}

/// How an item shows up for its recipients.
#[derive(Clone, Copy, Debug)]
enum Placement {
    Ground(Point4),
    Worn { wearer: EntityId, layer: u8 },
    Contained { container: EntityId, x: u16, y: u16 },
}

/// Pending item changes of one server.
#[derive(Debug)]
pub struct ItemSyncQueue {
    table: ChangeTable<ItemChangeState>,
    groups: PacketGroupPool,
    config: SyncConfig,
    viewers: parking_lot::Mutex<Vec<EntityId>>,
}

impl ItemSyncQueue {
    /// Creates an enabled queue building its groups from `groups`.
    #[must_use]
    pub fn new(groups: PacketGroupPool, config: SyncConfig) -> Self {
        Self {
            table: ChangeTable::new("item sync", config.state_pool_idle, ItemChangeState::default),
            groups,
            config,
            viewers: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// The pending table.
    #[must_use]
    pub fn table(&self) -> &ChangeTable<ItemChangeState> {
        &self.table
    }

    /// Turns the hooks on or off.
    pub fn set_enabled(&self, enabled: bool) {
        self.table.set_enabled(enabled);
    }

    /// ORs `flags` into the item's pending work, enqueueing it on the first
    /// mark since the last flush.
    ///
    /// # Errors
    ///
    /// Returns a sanity violation if `flags` is empty.
    pub fn mark(&self, item: EntityId, flags: ItemSyncFlags) -> SyncResult<()> {
        ensure(!flags.is_empty(), "item sync", || format!("empty sync flags for item {item}"))?;
        self.mark_nonempty(item, flags);
        Ok(())
    }

    fn mark_nonempty(&self, item: EntityId, flags: ItemSyncFlags) {
        debug_assert!(!flags.is_empty());
        if self.table.mark(item, |s| s.flags = s.flags.union(flags)).is_some() {
            tracing::trace!(%item, ?flags, "item about to change");
        }
    }

    /// Sends the item at the next flush.
    pub fn resend(&self, item: &dyn ItemView) {
        self.mark_nonempty(item.id(), ItemSyncFlags::RESEND);
    }

    /// The item is about to change.
    pub fn about_to_change(&self, item: &dyn ItemView) {
        self.mark_nonempty(item.id(), ItemSyncFlags::UPDATE);
    }

    /// The item's property list changed.
    pub fn properties_changed(&self, item: &dyn ItemView) {
        self.mark_nonempty(item.id(), ItemSyncFlags::PROPERTIES);
    }

    /// Returns true if `id` has pending changes.
    #[must_use]
    pub fn is_pending(&self, id: EntityId) -> bool {
        self.table.is_pending(id)
    }

    /// Processes every pending item once.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::FlushAborted`] on the first invariant
    /// violation; the rest of the batch stays queued.
    pub fn flush(&self, world: &dyn SyncWorld) -> SyncResult<FlushStats> {
        let mut out = Fanout::new(&self.groups);
        let mut viewers = self.viewers.lock();

        let dequeued = self.table.flush_with(|state| {
            let Some(item) = world.item(state.entity()).filter(|item| !item.is_deleted()) else {
                out.stats.skipped += 1;
                return Ok(());
            };
            out.stats.entities += 1;

            let flags = state.flags();
            if flags.intersects(ItemSyncFlags::RESEND.union(ItemSyncFlags::UPDATE)) {
                self.update_item(world, item, &mut out, &mut viewers)
            } else if self.config.properties {
                self.send_properties_only(world, item, &mut out, &mut viewers)
            } else {
                Ok(())
            }
        })?;

        if dequeued > 0 {
            tracing::debug!(
                dequeued,
                groups = out.stats.groups_built,
                sends = out.stats.sends,
                "item sync flushed"
            );
        }
        Ok(out.stats)
    }

    fn placement(world: &dyn SyncWorld, item: &dyn ItemView) -> Option<Placement> {
        match item.location() {
            ItemLocation::Ground(point) => Some(Placement::Ground(point)),
            ItemLocation::Equipped { wearer, layer } if layer < SENT_LAYERS => {
                world.character(wearer).map(|_| Placement::Worn { wearer, layer })
            }
            ItemLocation::Contained { container, x, y } => Some(Placement::Contained { container, x, y }),
            ItemLocation::Equipped { .. } | ItemLocation::Hidden => None,
        }
    }

    /// Fills `out` with everyone who might see the item.
    fn recipients(&self, world: &dyn SyncWorld, item: &dyn ItemView, out: &mut Vec<EntityId>) {
        out.clear();
        match item.location() {
            ItemLocation::Contained { container, .. } => world.container_viewers(container, out),
            ItemLocation::Ground(point) => world.players_in_range(point, self.config.max_update_range, out),
            ItemLocation::Equipped { wearer, .. } => {
                if let Some(ch) = world.character(wearer) {
                    world.players_in_range(ch.point(), self.config.max_update_range, out);
                }
            }
            ItemLocation::Hidden => {}
        }
    }

    fn update_item(
        &self,
        world: &dyn SyncWorld,
        item: &dyn ItemView,
        out: &mut Fanout<'_>,
        viewers: &mut Vec<EntityId>,
    ) -> SanityResult<()> {
        let Some(placement) = Self::placement(world, item) else {
            return Ok(());
        };
        let id = item.id();
        let hash = item.properties_hash().filter(|_| self.config.properties);
        tracing::debug!(item = %id, ?placement, "item update");

        let mut info = SharedGroup::default();
        let mut properties = SharedGroup::default();
        self.recipients(world, item, viewers);
        for &viewer in viewers.iter() {
            let Some(sink) = world.session(viewer) else {
                continue;
            };
            if !world.can_see_for_update(viewer, id, Sightline::Current).is_visible() {
                continue;
            }
            match placement {
                Placement::Ground(point) => info.send(out, sink, || GroundItem::new(item, point))?,
                Placement::Worn { wearer, layer } => info.send(out, sink, || WornItem::item(item, wearer, layer))?,
                Placement::Contained { container, x, y } => {
                    info.send(out, sink, || ContainerItem::new(item, container, x, y))?;
                }
            }
            if let Some(hash) = hash {
                properties.send(out, sink, || PropertiesRevision::new(id, hash))?;
            }
        }
        Ok(())
    }

    fn send_properties_only(
        &self,
        world: &dyn SyncWorld,
        item: &dyn ItemView,
        out: &mut Fanout<'_>,
        viewers: &mut Vec<EntityId>,
    ) -> SanityResult<()> {
        let Some(hash) = item.properties_hash() else {
            return Ok(());
        };
        let id = item.id();
        let mut properties = SharedGroup::default();
        self.recipients(world, item, viewers);
        for &viewer in viewers.iter() {
            if let Some(sink) = world.session(viewer) {
                if world.can_see_for_update(viewer, id, Sightline::Current).is_visible() {
                    properties.send(out, sink, || PropertiesRevision::new(id, hash))?;
                }
            }
        }
        Ok(())
    }
}

/// Sends the item's current placement to one recipient, outside the queue.
///
/// Used by callers that introduce items on their own, such as a container
/// being opened. Returns false if the item is not shown anywhere.
///
/// # Errors
///
/// Returns a sanity violation if the packet cannot be built.
pub fn send_item_info(
    groups: &PacketGroupPool,
    sink: &dyn PacketSink,
    world: &dyn SyncWorld,
    item: &dyn ItemView,
) -> SanityResult<bool> {
    let Some(placement) = ItemSyncQueue::placement(world, item) else {
        return Ok(false);
    };
    let mut out = Fanout::new(groups);
    match placement {
        Placement::Ground(point) => out.send_single(sink, &GroundItem::new(item, point))?,
        Placement::Worn { wearer, layer } => out.send_single(sink, &WornItem::item(item, wearer, layer))?,
        Placement::Contained { container, x, y } => {
            out.send_single(sink, &ContainerItem::new(item, container, x, y))?;
        }
    }
    Ok(true)
}
