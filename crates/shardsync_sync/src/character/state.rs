//! # Character Change-State
//!
//! What a character looked like before the first change of the current
//! batch. Every mark sets a category bit; only the mark that sets the bit
//! takes a snapshot, so later marks in the same batch diff against the
//! original baseline.
//!
//! ## Masks
//!
//! | Set            | Holds                                          |
//! |----------------|------------------------------------------------|
//! | `ChangeFlags`  | categories: name, position, vitals, ...        |
//! | `MovementBits` | how the position changed: walk, run, teleport  |
//!
//! The two sets never share numeric space.

use shardsync_core::{ensure, Poolable, SanityResult};

use crate::queue::ChangeRecord;
use crate::world::{
    CharFlags, CharacterView, Direction, EntityId, MountView, Point4, Stats, Vitals, SKILL_COUNT,
};

/// Change categories of a character.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ChangeFlags(u32);

impl ChangeFlags {
    /// Full resend, ignores every other category.
    pub const RESEND: u32 = 1 << 0;
    /// Model or color.
    pub const BASE_PROPS: u32 = 1 << 1;
    /// Facing.
    pub const DIRECTION: u32 = 1 << 2;
    /// Name.
    pub const NAME: u32 = 1 << 3;
    /// Status flags.
    pub const FLAGS: u32 = 1 << 4;
    /// Position.
    pub const POSITION: u32 = 1 << 5;
    /// Visibility, which can change for some observers without any flag.
    pub const VISIBILITY: u32 = 1 << 6;
    /// Mount.
    pub const MOUNT: u32 = 1 << 7;
    /// Notoriety colour.
    pub const HIGHLIGHT: u32 = 1 << 8;
    /// Hitpoints.
    pub const HITS: u32 = 1 << 9;
    /// Mana.
    pub const MANA: u32 = 1 << 10;
    /// Stamina.
    pub const STAMINA: u32 = 1 << 11;
    /// Status bar values.
    pub const STATS: u32 = 1 << 12;
    /// Property list.
    pub const PROPERTIES: u32 = 1 << 13;
    /// At least one skill.
    pub const SKILLS: u32 = 1 << 14;

    /// Returns the raw bits.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if every bit of `mask` is set.
    #[inline]
    #[must_use]
    pub const fn contains(self, mask: u32) -> bool {
        self.0 & mask == mask
    }

    /// Returns true if any bit of `mask` is set.
    #[inline]
    #[must_use]
    pub const fn intersects(self, mask: u32) -> bool {
        self.0 & mask != 0
    }

    /// Returns true if no category is set.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Sets `mask`, returning true if it was not fully set before.
    #[inline]
    pub fn insert(&mut self, mask: u32) -> bool {
        let new = !self.contains(mask);
        self.0 |= mask;
        new
    }
}

/// How a position change happened.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct MovementBits(u8);

impl MovementBits {
    /// A plain step.
    pub const WALKING: u8 = 0x01;
    /// A running step.
    pub const RUNNING: u8 = 0x02;
    /// The step was requested by the player's own client.
    pub const REQUESTED_STEP: u8 = 0x04;
    /// A jump to an arbitrary point.
    pub const TELEPORT: u8 = 0x08;

    /// Creates a set from raw bits.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// A plain step.
    #[must_use]
    pub const fn walking() -> Self {
        Self(Self::WALKING)
    }

    /// A running step.
    #[must_use]
    pub const fn running() -> Self {
        Self(Self::RUNNING)
    }

    /// A teleport.
    #[must_use]
    pub const fn teleport() -> Self {
        Self(Self::TELEPORT)
    }

    /// Returns the raw bits.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns true if every bit of `mask` is set.
    #[inline]
    #[must_use]
    pub const fn contains(self, mask: u8) -> bool {
        self.0 & mask == mask
    }

    /// Returns true if nothing is set.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns the set with `mask` added.
    #[inline]
    #[must_use]
    pub const fn with(self, mask: u8) -> Self {
        Self(self.0 | mask)
    }

    /// Returns the set with `mask` removed.
    #[inline]
    #[must_use]
    pub const fn without(self, mask: u8) -> Self {
        Self(self.0 & !mask)
    }
}

/// Categories and movement submodes recorded for one entity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChangeMask {
    /// Change categories.
    pub flags: ChangeFlags,
    /// Movement submodes of a position change.
    pub movement: MovementBits,
}

/// Outcome of comparing snapshotted and live status flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlagsDiff {
    /// A flag other than war mode differs.
    pub changed: bool,
    /// Visibility was marked, or the hidden flag differs.
    pub invis_changed: bool,
    /// The war mode flag differs.
    pub war_mode_changed: bool,
}

/// Outcome of comparing snapshotted and live position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PositionDiff {
    /// The point differs.
    pub changed: bool,
    /// The point differs and the move was a teleport.
    pub teleported: bool,
    /// The point differs and the move was a run.
    pub running: bool,
    /// The owning client asked for this step or turn.
    pub requested_step: bool,
}

/// Pooled pre-change snapshot of one character.
#[derive(Debug)]
pub struct CharChangeState {
    entity: EntityId,
    mask: ChangeMask,
    point: Point4,
    name: String,
    model: u16,
    color: u16,
    direction: Direction,
    flags: CharFlags,
    mount: Option<MountView>,
    vitals: Vitals,
    stats: Stats,
    skills: [u16; SKILL_COUNT],
    skill_count: usize,
}

impl Default for CharChangeState {
    fn default() -> Self {
        Self {
            entity: EntityId::default(),
            mask: ChangeMask::default(),
            point: Point4::default(),
            name: String::with_capacity(32),
            model: 0,
            color: 0,
            direction: Direction::default(),
            flags: CharFlags::default(),
            mount: None,
            vitals: Vitals::default(),
            stats: Stats::default(),
            skills: [0; SKILL_COUNT],
            skill_count: 0,
        }
    }
}

impl Poolable for CharChangeState {
    fn reset(&mut self) {
        self.entity = EntityId::default();
        self.mask = ChangeMask::default();
        self.name.clear();
        self.mount = None;
        self.skill_count = 0;
    }
}

impl ChangeRecord for CharChangeState {
    fn entity(&self) -> EntityId {
        self.entity
    }

    fn bind(&mut self, id: EntityId) {
        self.entity = id;
    }
}

impl CharChangeState {
    /// Returns the recorded mask.
    #[inline]
    #[must_use]
    pub const fn mask(&self) -> ChangeMask {
        self.mask
    }

    /// Returns true if a full resend was requested.
    #[inline]
    #[must_use]
    pub const fn is_resend(&self) -> bool {
        self.mask.flags.contains(ChangeFlags::RESEND)
    }

    /// Position before the first move of the batch.
    #[inline]
    #[must_use]
    pub const fn old_point(&self) -> Point4 {
        self.point
    }

    /// Mount before the first mount change of the batch.
    #[inline]
    #[must_use]
    pub const fn old_mount(&self) -> Option<MountView> {
        self.mount
    }

    /// Skill ids marked since the last flush, in marking order.
    #[must_use]
    pub fn skills(&self) -> &[u16] {
        &self.skills[..self.skill_count]
    }

    // ========================================================================
    // MARKS
    // ========================================================================

    pub(crate) fn mark_resend(&mut self) {
        self.mask.flags.insert(ChangeFlags::RESEND);
    }

    pub(crate) fn mark_properties(&mut self) {
        self.mask.flags.insert(ChangeFlags::PROPERTIES);
    }

    pub(crate) fn mark_skill(&mut self, id: u16) -> SanityResult<()> {
        ensure(usize::from(id) < SKILL_COUNT, "char sync", || {
            format!("skill id {id} out of range")
        })?;
        self.mask.flags.insert(ChangeFlags::SKILLS);
        if self.skills().contains(&id) {
            return Ok(());
        }
        self.skills[self.skill_count] = id;
        self.skill_count += 1;
        Ok(())
    }

    pub(crate) fn mark_name(&mut self, ch: &dyn CharacterView) {
        if self.mask.flags.insert(ChangeFlags::NAME) {
            self.name.clear();
            self.name.push_str(ch.name());
        }
    }

    pub(crate) fn mark_base_props(&mut self, ch: &dyn CharacterView) {
        if self.mask.flags.insert(ChangeFlags::BASE_PROPS) {
            self.model = ch.model();
            self.color = ch.color();
        }
    }

    pub(crate) fn mark_direction(&mut self, ch: &dyn CharacterView, requested: bool) {
        if self.mask.flags.insert(ChangeFlags::DIRECTION) {
            self.direction = ch.direction();
            self.mask.movement = if requested {
                self.mask.movement.with(MovementBits::REQUESTED_STEP)
            } else {
                self.mask.movement.without(MovementBits::REQUESTED_STEP)
            };
        }
    }

    pub(crate) fn mark_flags(&mut self, ch: &dyn CharacterView) {
        if self.mask.flags.insert(ChangeFlags::FLAGS) {
            self.flags = ch.flags();
        }
    }

    pub(crate) fn mark_visibility(&mut self, ch: &dyn CharacterView) {
        self.mask.flags.insert(ChangeFlags::VISIBILITY);
        self.mark_flags(ch);
    }

    pub(crate) fn mark_position(&mut self, ch: &dyn CharacterView, movement: MovementBits) -> SanityResult<()> {
        ensure(!movement.is_empty(), "char sync", || {
            format!("position change of {} without a movement kind", ch.id())
        })?;
        if self.mask.flags.insert(ChangeFlags::POSITION) {
            self.point = ch.point();
        }
        self.mask.movement = self.mask.movement.with(movement.bits());
        Ok(())
    }

    pub(crate) fn mark_mount(&mut self, ch: &dyn CharacterView) {
        if self.mask.flags.insert(ChangeFlags::MOUNT) {
            self.mount = ch.mount();
        }
    }

    pub(crate) fn mark_highlight(&mut self) {
        self.mask.flags.insert(ChangeFlags::HIGHLIGHT);
    }

    pub(crate) fn mark_hits(&mut self, ch: &dyn CharacterView) {
        if self.mask.flags.insert(ChangeFlags::HITS) {
            let v = ch.vitals();
            self.vitals.hits = v.hits;
            self.vitals.max_hits = v.max_hits;
        }
    }

    pub(crate) fn mark_mana(&mut self, ch: &dyn CharacterView) {
        if self.mask.flags.insert(ChangeFlags::MANA) {
            let v = ch.vitals();
            self.vitals.mana = v.mana;
            self.vitals.max_mana = v.max_mana;
        }
    }

    pub(crate) fn mark_stamina(&mut self, ch: &dyn CharacterView) {
        if self.mask.flags.insert(ChangeFlags::STAMINA) {
            let v = ch.vitals();
            self.vitals.stamina = v.stamina;
            self.vitals.max_stamina = v.max_stamina;
        }
    }

    pub(crate) fn mark_stats(&mut self, ch: &dyn CharacterView) {
        if self.mask.flags.insert(ChangeFlags::STATS) {
            self.stats = ch.stats();
        }
    }

    // ========================================================================
    // DIFFS
    // ========================================================================

    /// Movement submodes only make sense next to a move or a turn.
    pub(crate) fn check(&self) -> SanityResult<()> {
        ensure(
            self.mask.movement.is_empty()
                || self
                    .mask
                    .flags
                    .intersects(ChangeFlags::POSITION | ChangeFlags::DIRECTION),
            "char sync",
            || format!("{} has movement bits without a position or direction mark", self.entity),
        )
    }

    fn marked(&self, mask: u32) -> bool {
        self.mask.flags.contains(mask)
    }

    pub(crate) fn name_changed(&self, ch: &dyn CharacterView) -> bool {
        self.marked(ChangeFlags::NAME) && self.name != ch.name()
    }

    pub(crate) fn base_props_changed(&self, ch: &dyn CharacterView) -> bool {
        self.marked(ChangeFlags::BASE_PROPS) && (self.model != ch.model() || self.color != ch.color())
    }

    pub(crate) fn direction_changed(&self, ch: &dyn CharacterView) -> bool {
        self.marked(ChangeFlags::DIRECTION) && self.direction != ch.direction()
    }

    pub(crate) fn flags_diff(&self, ch: &dyn CharacterView) -> FlagsDiff {
        if !self.marked(ChangeFlags::FLAGS) {
            return FlagsDiff::default();
        }
        let delta = self.flags.bits() ^ ch.flags().bits();
        FlagsDiff {
            changed: delta & !CharFlags::WAR_MODE != 0,
            invis_changed: self.marked(ChangeFlags::VISIBILITY) || delta & CharFlags::HIDDEN != 0,
            war_mode_changed: delta & CharFlags::WAR_MODE != 0,
        }
    }

    pub(crate) fn position_diff(&self, ch: &dyn CharacterView) -> PositionDiff {
        let movement = self.mask.movement;
        let changed = self.marked(ChangeFlags::POSITION) && self.point != ch.point();
        PositionDiff {
            changed,
            teleported: changed && movement.contains(MovementBits::TELEPORT),
            running: changed && movement.contains(MovementBits::RUNNING),
            requested_step: movement.contains(MovementBits::REQUESTED_STEP),
        }
    }

    pub(crate) fn mount_changed(&self, ch: &dyn CharacterView) -> bool {
        self.marked(ChangeFlags::MOUNT) && self.mount.map(|m| m.id) != ch.mount().map(|m| m.id)
    }

    pub(crate) fn highlight_changed(&self) -> bool {
        self.marked(ChangeFlags::HIGHLIGHT)
    }

    pub(crate) fn hits_changed(&self, ch: &dyn CharacterView) -> bool {
        let v = ch.vitals();
        self.marked(ChangeFlags::HITS) && (self.vitals.hits, self.vitals.max_hits) != (v.hits, v.max_hits)
    }

    pub(crate) fn mana_changed(&self, ch: &dyn CharacterView) -> bool {
        let v = ch.vitals();
        self.marked(ChangeFlags::MANA) && (self.vitals.mana, self.vitals.max_mana) != (v.mana, v.max_mana)
    }

    pub(crate) fn stamina_changed(&self, ch: &dyn CharacterView) -> bool {
        let v = ch.vitals();
        self.marked(ChangeFlags::STAMINA)
            && (self.vitals.stamina, self.vitals.max_stamina) != (v.stamina, v.max_stamina)
    }

    pub(crate) fn stats_changed(&self, ch: &dyn CharacterView) -> bool {
        self.marked(ChangeFlags::STATS) && self.stats != ch.stats()
    }

    pub(crate) fn properties_changed(&self) -> bool {
        self.marked(ChangeFlags::PROPERTIES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::SkillValue;

    struct Live {
        name: &'static str,
        point: Point4,
        flags: CharFlags,
        vitals: Vitals,
    }

    impl Default for Live {
        fn default() -> Self {
            Self {
                name: "Alice",
                point: Point4::new(100, 100, 0, 0),
                flags: CharFlags::default(),
                vitals: Vitals {
                    hits: 50,
                    max_hits: 50,
                    ..Vitals::default()
                },
            }
        }
    }

    impl CharacterView for Live {
        fn id(&self) -> EntityId {
            EntityId(7)
        }
        fn is_deleted(&self) -> bool {
            false
        }
        fn point(&self) -> Point4 {
            self.point
        }
        fn name(&self) -> &str {
            self.name
        }
        fn model(&self) -> u16 {
            0x190
        }
        fn color(&self) -> u16 {
            0
        }
        fn direction(&self) -> Direction {
            Direction::North
        }
        fn flags(&self) -> CharFlags {
            self.flags
        }
        fn mount(&self) -> Option<MountView> {
            None
        }
        fn vitals(&self) -> Vitals {
            self.vitals
        }
        fn stats(&self) -> Stats {
            Stats::default()
        }
        fn skill(&self, _id: u16) -> Option<SkillValue> {
            None
        }
    }

    #[test]
    fn test_first_mark_keeps_baseline() {
        let mut live = Live::default();
        let mut state = CharChangeState::default();

        state.mark_name(&live);
        live.name = "Carol";
        state.mark_name(&live);
        live.name = "Alice";

        assert!(!state.name_changed(&live));
        live.name = "Bob";
        assert!(state.name_changed(&live));
    }

    #[test]
    fn test_skills_are_deduplicated() {
        let mut state = CharChangeState::default();
        for id in [3, 5, 3, 3, 5] {
            state.mark_skill(id).unwrap();
        }
        assert_eq!(state.skills(), &[3, 5]);
        assert!(state.mark_skill(SKILL_COUNT as u16).is_err());
    }

    #[test]
    fn test_war_mode_is_not_a_flag_change() {
        let mut live = Live::default();
        let mut state = CharChangeState::default();
        state.mark_flags(&live);
        live.flags = live.flags.with(CharFlags::WAR_MODE);

        let diff = state.flags_diff(&live);
        assert!(!diff.changed);
        assert!(diff.war_mode_changed);
        assert!(!diff.invis_changed);
    }

    #[test]
    fn test_visibility_mark_forces_invis_change() {
        let live = Live::default();
        let mut state = CharChangeState::default();
        state.mark_visibility(&live);
        assert!(state.flags_diff(&live).invis_changed);
    }

    #[test]
    fn test_requested_direction_only_counts_on_first_mark() {
        let live = Live::default();
        let mut state = CharChangeState::default();
        state.mark_direction(&live, true);
        state.mark_direction(&live, false);
        assert!(state.mask().movement.contains(MovementBits::REQUESTED_STEP));
        assert!(state.check().is_ok());
    }

    #[test]
    fn test_position_requires_movement_kind() {
        let live = Live::default();
        let mut state = CharChangeState::default();
        assert!(state.mark_position(&live, MovementBits::default()).is_err());

        state.mark_position(&live, MovementBits::teleport()).unwrap();
        let mut moved = Live::default();
        moved.point.x += 40;
        let diff = state.position_diff(&moved);
        assert!(diff.changed && diff.teleported && !diff.running);
    }

    #[test]
    fn test_reset_clears_marks() {
        let live = Live::default();
        let mut state = CharChangeState::default();
        state.bind(EntityId(7));
        state.mark_hits(&live);
        state.mark_skill(1).unwrap();
        state.reset();

        assert_eq!(state.mask(), ChangeMask::default());
        assert!(state.skills().is_empty());
        assert_eq!(state.entity(), EntityId::default());
    }
}
