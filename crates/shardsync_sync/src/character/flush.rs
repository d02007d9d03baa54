//! # Character Flush
//!
//! Turns one detached change-state into packets.
//!
//! ## Incremental update
//!
//! ```text
//!   diff snapshot vs live
//!        │
//!        ├──► own session: skills, status, vitals, self view, facet, war mode
//!        │
//!        └──► observers in range:
//!               saw before │ sees now │ packet
//!              ────────────┼──────────┼─────────────────────────
//!                  yes     │   no     │ DeleteObject
//!                  no      │   yes    │ DrawObject + hits
//!                  yes     │   yes    │ UpdatePlayer / mount / status
//!                  no      │   no     │ nothing
//! ```

use shardsync_core::SanityResult;
use shardsync_net::PacketSink;

use super::state::{CharChangeState, FlagsDiff, PositionDiff};
use crate::config::SyncConfig;
use crate::fanout::{Fanout, SharedGroup, VariantCache};
use crate::packets::{
    DeleteObject, DrawObject, DrawPlayer, GroundItem, MobAttributes, PropertiesRevision, SkillUpdate, StatusBar,
    StatusBarKind, UpdatePlayer, UpdateVital, VitalKind, WornItem,
};
use crate::prepared::PreparedGroups;
use crate::world::{CharacterView, EntityId, ItemLocation, Sightline, SyncWorld};

/// Reusable id lists for range queries.
#[derive(Debug, Default)]
pub(super) struct Scratch {
    viewers: Vec<EntityId>,
    things: Vec<EntityId>,
}

/// Everything the observer loop shares across viewers.
#[derive(Default)]
struct ObserverGroups {
    delete_object: SharedGroup,
    pet_status: SharedGroup,
    other_status: SharedGroup,
    hits_percent: SharedGroup,
    properties: SharedGroup,
    char_infos: VariantCache,
    movings: VariantCache,
}

/// Remove and update groups for a mount change, shared by self and observers.
#[derive(Default)]
struct MountGroups {
    remove: SharedGroup,
    update: SharedGroup,
}

/// Diff results of one incremental update.
#[derive(Clone, Copy, Debug)]
struct Changes {
    flags: FlagsDiff,
    pos: PositionDiff,
    highlight: bool,
    hits: bool,
    name: bool,
    mount: bool,
    direction: bool,
    base_props: bool,
    properties: bool,
}

impl Changes {
    fn diff(state: &CharChangeState, ch: &dyn CharacterView) -> Self {
        Self {
            flags: state.flags_diff(ch),
            pos: state.position_diff(ch),
            highlight: state.highlight_changed(),
            hits: state.hits_changed(ch),
            name: state.name_changed(ch),
            mount: state.mount_changed(ch),
            direction: state.direction_changed(ch),
            base_props: state.base_props_changed(ch),
            properties: state.properties_changed(),
        }
    }

    /// Anything observers see as a moving or changed body.
    fn moving(&self) -> bool {
        self.pos.changed
            || self.direction
            || self.flags.changed
            || self.flags.war_mode_changed
            || self.highlight
            || self.base_props
    }

    /// Anything observers need to hear about at all.
    fn observable(&self) -> bool {
        self.moving() || self.flags.invis_changed || self.hits || self.name || self.mount
    }
}

/// One flush pass over the character queue.
pub(super) struct CharPass<'a, 'g> {
    pub(super) world: &'a dyn SyncWorld,
    pub(super) config: &'a SyncConfig,
    pub(super) prepared: &'a PreparedGroups,
    pub(super) out: &'a mut Fanout<'g>,
    pub(super) scratch: &'a mut Scratch,
}

impl CharPass<'_, '_> {
    fn sees(&self, observer: EntityId, target: EntityId, sightline: Sightline) -> bool {
        self.world.can_see_for_update(observer, target, sightline).is_visible()
    }

    fn properties_hash(&self, ch: &dyn CharacterView) -> Option<u32> {
        if self.config.properties {
            ch.properties_hash()
        } else {
            None
        }
    }

    // ========================================================================
    // RESEND
    // ========================================================================

    /// Sends the complete current state to the character and everyone who
    /// can see it, ignoring every snapshot.
    pub(super) fn resend(&mut self, ch: &dyn CharacterView) -> SanityResult<()> {
        let world = self.world;
        let id = ch.id();
        tracing::debug!(entity = %id, "char resend");

        if let Some(sink) = world.session(id) {
            self.out.send_single(sink, &DrawPlayer::new(ch))?;
        }

        let hash = self.properties_hash(ch);
        let mut char_infos = VariantCache::default();
        let mut properties = SharedGroup::default();

        let mut viewers = std::mem::take(&mut self.scratch.viewers);
        viewers.clear();
        world.players_in_range(ch.point(), self.config.max_update_range, &mut viewers);

        let result = viewers.iter().try_for_each(|&viewer| -> SanityResult<()> {
            if viewer == id {
                return Ok(());
            }
            let Some(sink) = world.session(viewer) else {
                return Ok(());
            };
            if !self.sees(viewer, id, Sightline::Current) {
                return Ok(());
            }
            let highlight = world.highlight_for(id, viewer);
            char_infos.send(self.out, sink, highlight, |h| DrawObject::new(ch, h))?;
            if let Some(hash) = hash {
                properties.send(self.out, sink, || PropertiesRevision::new(id, hash))?;
            }
            Ok(())
        });
        self.scratch.viewers = viewers;
        result
    }

    // ========================================================================
    // INCREMENTAL UPDATE
    // ========================================================================

    /// Sends only what really changed since the snapshots were taken.
    pub(super) fn update(&mut self, state: &CharChangeState, ch: &dyn CharacterView) -> SanityResult<()> {
        let world = self.world;
        let id = ch.id();
        let changes = Changes::diff(state, ch);
        tracing::debug!(entity = %id, ?changes, "char update");

        let mut mounts = MountGroups::default();

        if let Some(sink) = world.session(id) {
            self.update_self(sink, state, ch, &changes, &mut mounts)?;
        }

        if changes.observable() {
            let mut range = self.config.max_update_range;
            if changes.pos.teleported {
                self.remove_from_view_if_needed(state, ch)?;
            } else if changes.pos.changed {
                // a plain step also reaches whoever stands one tile further
                range = range.saturating_add(1);
            }
            self.update_observers(state, ch, &changes, &mut mounts, range)?;
        }
        Ok(())
    }

    fn update_self(
        &mut self,
        sink: &dyn PacketSink,
        state: &CharChangeState,
        ch: &dyn CharacterView,
        changes: &Changes,
        mounts: &mut MountGroups,
    ) -> SanityResult<()> {
        let world = self.world;
        let id = ch.id();
        self.send_skills(sink, state, ch)?;

        if changes.properties {
            if let Some(hash) = self.properties_hash(ch) {
                self.out.send_single(sink, &PropertiesRevision::new(id, hash))?;
            }
        }

        if state.stats_changed(ch) || changes.name {
            tracing::debug!(entity = %id, "status bar to self");
            self.out.send_single(sink, &StatusBar::new(ch, StatusBarKind::Me))?;
        } else {
            let mana = state.mana_changed(ch);
            let stamina = state.stamina_changed(ch);
            if changes.hits && mana && stamina {
                self.out.send_single(sink, &MobAttributes::new(ch))?;
            } else {
                if mana {
                    self.out.send_single(sink, &UpdateVital::exact(ch, VitalKind::Mana))?;
                }
                if stamina {
                    self.out.send_single(sink, &UpdateVital::exact(ch, VitalKind::Stamina))?;
                }
                if changes.hits {
                    self.out.send_single(sink, &UpdateVital::exact(ch, VitalKind::Hits))?;
                }
            }
        }

        let pos = changes.pos;
        if changes.flags.changed
            || changes.base_props
            || ((changes.direction || pos.changed) && (!pos.requested_step || pos.teleported))
        {
            tracing::debug!(entity = %id, "self view to self");
            self.out.send_single(sink, &DrawPlayer::new(ch))?;
        }

        if changes.highlight {
            let highlight = world.highlight_for(id, id);
            self.out.send_single(sink, &DrawObject::new(ch, highlight))?;
        }

        if changes.flags.war_mode_changed {
            self.out.send(sink, self.prepared.war_mode(ch.flags().war_mode()));
        }

        if pos.changed {
            self.refresh_own_view(sink, state, ch)?;
        }

        if changes.mount {
            self.send_mount_change(sink, state, ch, mounts)?;
        }
        Ok(())
    }

    fn send_skills(&mut self, sink: &dyn PacketSink, state: &CharChangeState, ch: &dyn CharacterView) -> SanityResult<()> {
        if state.skills().is_empty() {
            return Ok(());
        }
        let group = self.out.single_use();
        for &skill in state.skills() {
            if let Some(value) = ch.skill(skill) {
                tracing::debug!(entity = %ch.id(), skill, "skill update");
                group.add_packet(&SkillUpdate::new(skill, value))?;
            }
        }
        if !group.is_empty() {
            self.out.send(sink, &group);
        }
        Ok(())
    }

    /// After a move: clears the old view on a map change, then introduces
    /// everything the character could not see before.
    fn refresh_own_view(&mut self, sink: &dyn PacketSink, state: &CharChangeState, ch: &dyn CharacterView) -> SanityResult<()> {
        let world = self.world;
        let id = ch.id();
        let old = state.old_point();
        let now = ch.point();
        let map_changed = old.map != now.map;
        let range = world.update_range(id);

        let mut things = std::mem::take(&mut self.scratch.things);
        let result = (|| -> SanityResult<()> {
            if map_changed {
                let facet = world.facet_of(now.map);
                if world.facet_of(old.map) != facet {
                    if let Some(group) = self.prepared.facet_change(facet) {
                        self.out.send(sink, group);
                    }
                }

                things.clear();
                world.things_in_range(old, range, &mut things);
                let mut clear = None;
                for &thing in things.iter().filter(|&&t| t != id) {
                    tracing::debug!(entity = %id, %thing, "removing from own view");
                    let group = clear.get_or_insert_with(|| self.out.single_use());
                    group.add_packet(&DeleteObject::new(thing))?;
                }
                if let Some(group) = clear {
                    self.out.send(sink, &group);
                }
            }

            things.clear();
            world.things_in_range(now, range, &mut things);
            for &thing in things.iter().filter(|&&t| t != id) {
                let new_in_view = self.sees(id, thing, Sightline::Current)
                    && (map_changed || !self.sees(id, thing, Sightline::ObserverAt(old)));
                if new_in_view {
                    self.introduce(sink, id, thing)?;
                }
            }
            Ok(())
        })();
        self.scratch.things = things;
        result
    }

    fn introduce(&mut self, sink: &dyn PacketSink, viewer: EntityId, thing: EntityId) -> SanityResult<()> {
        let world = self.world;
        tracing::debug!(entity = %viewer, %thing, "introducing to own view");
        if let Some(other) = world.character(thing) {
            let highlight = world.highlight_for(thing, viewer);
            self.out.send_single(sink, &DrawObject::new(other, highlight))?;
            if let Some(hash) = self.properties_hash(other) {
                self.out.send_single(sink, &PropertiesRevision::new(thing, hash))?;
            }
            self.out.send_single(sink, &UpdateVital::hits_percent(other))?;
        } else if let Some(item) = world.item(thing) {
            if let ItemLocation::Ground(point) = item.location() {
                self.out.send_single(sink, &GroundItem::new(item, point))?;
                if let Some(hash) = item.properties_hash().filter(|_| self.config.properties) {
                    self.out.send_single(sink, &PropertiesRevision::new(thing, hash))?;
                }
            }
        }
        Ok(())
    }

    fn send_mount_change(
        &mut self,
        sink: &dyn PacketSink,
        state: &CharChangeState,
        ch: &dyn CharacterView,
        mounts: &mut MountGroups,
    ) -> SanityResult<()> {
        match ch.mount() {
            Some(mount) => mounts.update.send(self.out, sink, || WornItem::mount(ch.id(), mount)),
            None => match state.old_mount() {
                Some(old) => mounts.remove.send(self.out, sink, || DeleteObject::mount(old.id)),
                None => Ok(()),
            },
        }
    }

    /// After a teleport: tells everyone who saw the character at its old
    /// point and cannot see it now to drop it.
    fn remove_from_view_if_needed(&mut self, state: &CharChangeState, ch: &dyn CharacterView) -> SanityResult<()> {
        let world = self.world;
        let id = ch.id();
        let old = state.old_point();
        let mut delete = SharedGroup::default();

        let mut viewers = std::mem::take(&mut self.scratch.viewers);
        viewers.clear();
        world.players_in_range(old, self.config.max_update_range, &mut viewers);
        let result = viewers.iter().try_for_each(|&viewer| -> SanityResult<()> {
            if viewer == id {
                return Ok(());
            }
            let Some(sink) = world.session(viewer) else {
                return Ok(());
            };
            if self.sees(viewer, id, Sightline::TargetAt(old)) && !self.sees(viewer, id, Sightline::Current) {
                tracing::debug!(entity = %id, %viewer, "removing from view after teleport");
                delete.send(self.out, sink, || DeleteObject::new(id))?;
            }
            Ok(())
        });
        self.scratch.viewers = viewers;
        result
    }

    fn update_observers(
        &mut self,
        state: &CharChangeState,
        ch: &dyn CharacterView,
        changes: &Changes,
        mounts: &mut MountGroups,
        range: u16,
    ) -> SanityResult<()> {
        let world = self.world;
        let id = ch.id();
        let hash = self.properties_hash(ch);
        let mut groups = ObserverGroups::default();

        let mut viewers = std::mem::take(&mut self.scratch.viewers);
        viewers.clear();
        world.players_in_range(ch.point(), range, &mut viewers);
        let result = viewers.iter().try_for_each(|&viewer| -> SanityResult<()> {
            if viewer == id {
                return Ok(());
            }
            match world.session(viewer) {
                Some(sink) => self.observe(viewer, sink, state, ch, changes, hash, &mut groups, mounts),
                None => Ok(()),
            }
        });
        self.scratch.viewers = viewers;
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn observe(
        &mut self,
        viewer: EntityId,
        sink: &dyn PacketSink,
        state: &CharChangeState,
        ch: &dyn CharacterView,
        changes: &Changes,
        hash: Option<u32>,
        groups: &mut ObserverGroups,
        mounts: &mut MountGroups,
    ) -> SanityResult<()> {
        let world = self.world;
        let id = ch.id();
        let old = state.old_point();
        let pos = changes.pos;
        let invis = changes.flags.invis_changed;

        // Lazily evaluated visibility at the old point and right now.
        let mut saw_at_old: Option<bool> = None;
        let mut sees_now: Option<bool> = None;

        if !pos.teleported && (invis || pos.changed) {
            if !invis {
                saw_at_old = Some(self.sees(viewer, id, Sightline::TargetAt(old)));
            }
            if invis || saw_at_old == Some(true) {
                let sees = self.sees(viewer, id, Sightline::Current);
                sees_now = Some(sees);
                if !sees {
                    tracing::debug!(entity = %id, %viewer, "removing from view");
                    groups.delete_object.send(self.out, sink, || DeleteObject::new(id))?;
                }
            }
        }

        let sees_now = match sees_now {
            Some(sees) => sees,
            None => self.sees(viewer, id, Sightline::Current),
        };
        if !sees_now {
            return Ok(());
        }

        let mut hits_sent = false;
        let mut new_char_sent = false;
        if invis || pos.changed {
            let saw_before = !invis
                && match saw_at_old {
                    Some(saw) => saw,
                    None => self.sees(viewer, id, Sightline::TargetAt(old)),
                };
            if !saw_before {
                tracing::debug!(entity = %id, %viewer, "new char to observer");
                let highlight = world.highlight_for(id, viewer);
                groups
                    .char_infos
                    .send(self.out, sink, highlight, |h| DrawObject::new(ch, h))?;
                new_char_sent = true;
                if let Some(hash) = hash {
                    groups
                        .properties
                        .send(self.out, sink, || PropertiesRevision::new(id, hash))?;
                }
                groups
                    .hits_percent
                    .send(self.out, sink, || UpdateVital::hits_percent(ch))?;
                hits_sent = true;
            }
        }

        if !new_char_sent {
            if changes.properties {
                if let Some(hash) = hash {
                    groups
                        .properties
                        .send(self.out, sink, || PropertiesRevision::new(id, hash))?;
                }
            }
            if changes.moving() {
                tracing::debug!(entity = %id, %viewer, "moving char to observer");
                let highlight = world.highlight_for(id, viewer);
                groups
                    .movings
                    .send(self.out, sink, highlight, |h| UpdatePlayer::new(ch, pos.running, h))?;
            }
            if changes.mount {
                self.send_mount_change(sink, state, ch, mounts)?;
            }
        }

        if changes.name {
            hits_sent = true;
            if world.can_rename(viewer, id) {
                groups
                    .pet_status
                    .send(self.out, sink, || StatusBar::new(ch, StatusBarKind::Pet))?;
            } else {
                groups
                    .other_status
                    .send(self.out, sink, || StatusBar::new(ch, StatusBarKind::Other))?;
            }
        }

        if changes.hits && !hits_sent {
            groups
                .hits_percent
                .send(self.out, sink, || UpdateVital::hits_percent(ch))?;
        }
        Ok(())
    }
}
