//! # Character Sync Queue
//!
//! Gameplay code calls an `about_to_change_*` hook right before it mutates
//! a character. The first hook of a batch attaches a pooled
//! [`CharChangeState`] and enqueues the character; [`CharSyncQueue::flush`]
//! later compares every snapshot with the live value and sends only what
//! really changed.
//!
//! ```text
//!   gameplay                       flush (once per tick)
//!   ────────                       ─────────────────────
//!   about_to_change_name(ch) ─┐    detach state
//!   ch.name = "Bob"           ├──► resend?  ── yes ──► full state to all
//!   about_to_change_hits(ch) ─┘         │
//!   ch.hits -= 5                        └── no ──► diff ──► fan-out
//! ```

mod flush;
pub mod state;

use parking_lot::Mutex;
use shardsync_net::PacketGroupPool;

use self::flush::{CharPass, Scratch};
pub use self::state::{ChangeFlags, ChangeMask, CharChangeState, FlagsDiff, MovementBits, PositionDiff};
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::fanout::{Fanout, FlushStats};
use crate::prepared::PreparedGroups;
use crate::queue::{ChangeRecord, ChangeTable};
use crate::world::{CharacterView, EntityId, SyncWorld};

/// Pending character changes of one server.
#[derive(Debug)]
pub struct CharSyncQueue {
    table: ChangeTable<CharChangeState>,
    groups: PacketGroupPool,
    prepared: PreparedGroups,
    config: SyncConfig,
    scratch: Mutex<Scratch>,
}

impl CharSyncQueue {
    /// Creates an enabled queue building its groups from `groups`.
    ///
    /// # Errors
    ///
    /// Returns a sanity violation if the prepared groups cannot be built.
    pub fn new(groups: PacketGroupPool, config: SyncConfig) -> SyncResult<Self> {
        let prepared = PreparedGroups::new(&groups)?;
        Ok(Self {
            table: ChangeTable::new("char sync", config.state_pool_idle, CharChangeState::default),
            groups,
            prepared,
            config,
            scratch: Mutex::new(Scratch::default()),
        })
    }

    /// Cached groups shared with the rest of the server.
    #[must_use]
    pub fn prepared(&self) -> &PreparedGroups {
        &self.prepared
    }

    /// The pending table.
    #[must_use]
    pub fn table(&self) -> &ChangeTable<CharChangeState> {
        &self.table
    }

    /// Turns the hooks on or off.
    pub fn set_enabled(&self, enabled: bool) {
        self.table.set_enabled(enabled);
    }

    fn mark<R>(&self, ch: &dyn CharacterView, what: &'static str, f: impl FnOnce(&mut CharChangeState) -> R) -> Option<R> {
        let result = self.table.mark(ch.id(), f);
        if result.is_some() {
            tracing::trace!(entity = %ch.id(), what, "char about to change");
        }
        result
    }

    // ========================================================================
    // HOOKS
    // ========================================================================

    /// Sends the complete state at the next flush, skipping every diff.
    pub fn resend(&self, ch: &dyn CharacterView) {
        self.mark(ch, "resend", CharChangeState::mark_resend);
    }

    /// The property list changed.
    pub fn properties_changed(&self, ch: &dyn CharacterView) {
        self.mark(ch, "properties", CharChangeState::mark_properties);
    }

    /// Skill `skill` is about to change.
    ///
    /// # Errors
    ///
    /// Returns a sanity violation for an unknown skill id.
    pub fn about_to_change_skill(&self, ch: &dyn CharacterView, skill: u16) -> SyncResult<()> {
        self.mark(ch, "skill", |s| s.mark_skill(skill)).transpose()?;
        Ok(())
    }

    /// The name is about to change.
    pub fn about_to_change_name(&self, ch: &dyn CharacterView) {
        self.mark(ch, "name", |s| s.mark_name(ch));
    }

    /// Model or color are about to change.
    pub fn about_to_change_base_props(&self, ch: &dyn CharacterView) {
        self.mark(ch, "base props", |s| s.mark_base_props(ch));
    }

    /// The facing is about to change; `requested` when the player's own
    /// client asked for it.
    pub fn about_to_change_direction(&self, ch: &dyn CharacterView, requested: bool) {
        self.mark(ch, "direction", |s| s.mark_direction(ch, requested));
    }

    /// Status flags are about to change.
    pub fn about_to_change_flags(&self, ch: &dyn CharacterView) {
        self.mark(ch, "flags", |s| s.mark_flags(ch));
    }

    /// Visibility is about to change, possibly for some observers only.
    pub fn about_to_change_visibility(&self, ch: &dyn CharacterView) {
        self.mark(ch, "visibility", |s| s.mark_visibility(ch));
    }

    /// The position is about to change by `movement`.
    ///
    /// # Errors
    ///
    /// Returns a sanity violation if `movement` is empty.
    pub fn about_to_change_position(&self, ch: &dyn CharacterView, movement: MovementBits) -> SyncResult<()> {
        self.mark(ch, "position", |s| s.mark_position(ch, movement)).transpose()?;
        Ok(())
    }

    /// The mount is about to change.
    pub fn about_to_change_mount(&self, ch: &dyn CharacterView) {
        self.mark(ch, "mount", |s| s.mark_mount(ch));
    }

    /// The notoriety colour is about to change.
    pub fn about_to_change_highlight(&self, ch: &dyn CharacterView) {
        self.mark(ch, "highlight", CharChangeState::mark_highlight);
    }

    /// Hitpoints are about to change.
    pub fn about_to_change_hitpoints(&self, ch: &dyn CharacterView) {
        self.mark(ch, "hitpoints", |s| s.mark_hits(ch));
    }

    /// Mana is about to change.
    pub fn about_to_change_mana(&self, ch: &dyn CharacterView) {
        self.mark(ch, "mana", |s| s.mark_mana(ch));
    }

    /// Stamina is about to change.
    pub fn about_to_change_stamina(&self, ch: &dyn CharacterView) {
        self.mark(ch, "stamina", |s| s.mark_stamina(ch));
    }

    /// Status bar values are about to change.
    pub fn about_to_change_stats(&self, ch: &dyn CharacterView) {
        self.mark(ch, "stats", |s| s.mark_stats(ch));
    }

    // ========================================================================
    // FLUSH
    // ========================================================================

    /// Processes every pending character once.
    ///
    /// Call once per tick from the game-logic thread.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::FlushAborted`] on the first invariant
    /// violation; the rest of the batch stays queued.
    pub fn flush(&self, world: &dyn SyncWorld) -> SyncResult<FlushStats> {
        let mut out = Fanout::new(&self.groups);
        let mut scratch = self.scratch.lock();

        let dequeued = self.table.flush_with(|state| {
            let Some(ch) = world.character(state.entity()).filter(|ch| !ch.is_deleted()) else {
                tracing::debug!(entity = %state.entity(), "skipping deleted char");
                out.stats.skipped += 1;
                return Ok(());
            };
            state.check()?;
            out.stats.entities += 1;

            let mut pass = CharPass {
                world,
                config: &self.config,
                prepared: &self.prepared,
                out: &mut out,
                scratch: &mut *scratch,
            };
            if state.is_resend() {
                pass.resend(ch)
            } else {
                pass.update(state, ch)
            }
        })?;

        if dequeued > 0 {
            tracing::debug!(
                dequeued,
                groups = out.stats.groups_built,
                sends = out.stats.sends,
                "char sync flushed"
            );
        }
        Ok(out.stats)
    }

    /// Returns true if `id` has pending changes.
    #[must_use]
    pub fn is_pending(&self, id: EntityId) -> bool {
        self.table.is_pending(id)
    }
}
