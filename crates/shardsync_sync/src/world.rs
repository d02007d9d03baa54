//! # World Contract
//!
//! What the sync queues read from the domain model. The game server owns
//! characters, items, maps and sessions; this crate only sees them through
//! the traits below.
//!
//! ```text
//! domain model                         sync queues
//! ┌──────────────────────┐   reads    ┌────────────────────┐
//! │ impl CharacterView   │ ◄───────── │ snapshot / diff    │
//! │ impl ItemView        │            │                    │
//! │ impl SyncWorld       │ ◄───────── │ range, visibility  │
//! │   session() ─────────┼──► PacketSink (send groups)     │
//! └──────────────────────┘            └────────────────────┘
//! ```

use std::fmt;

use bytemuck::{Pod, Zeroable};

pub use shardsync_net::PacketSink;

/// Radius within which observers receive an entity's changes.
pub const MAX_UPDATE_RANGE: u16 = 18;

/// Equipment layers below this one are visible to other players.
pub const SENT_LAYERS: u8 = 25;

/// Number of distinct skills a character has.
pub const SKILL_COUNT: usize = 58;

/// Number of client facets.
pub const FACET_COUNT: usize = 6;

/// Identity of a character or item. Characters and items share one id space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u32);

impl EntityId {
    /// Returns the raw serial.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// A position on one map.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Point4 {
    /// West-east coordinate.
    pub x: u16,
    /// North-south coordinate.
    pub y: u16,
    /// Altitude.
    pub z: i8,
    /// World partition.
    pub map: u8,
}

impl Point4 {
    /// Creates a point.
    #[inline]
    #[must_use]
    pub const fn new(x: u16, y: u16, z: i8, map: u8) -> Self {
        Self { x, y, z, map }
    }

    /// Returns true if `other` is on the same map within `range` tiles
    /// (Chebyshev distance).
    #[inline]
    #[must_use]
    pub const fn in_range(&self, other: &Self, range: u16) -> bool {
        self.map == other.map && self.x.abs_diff(other.x) <= range && self.y.abs_diff(other.y) <= range
    }

    /// The neighbouring tile in `direction`, clamped to the map origin.
    #[must_use]
    pub const fn step(self, direction: Direction) -> Self {
        let (dx, dy) = direction.offset();
        Self {
            x: self.x.saturating_add_signed(dx),
            y: self.y.saturating_add_signed(dy),
            ..self
        }
    }
}

/// Facing direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Direction {
    /// Facing north.
    #[default]
    North = 0,
    /// Facing north-east.
    NorthEast = 1,
    /// Facing east.
    East = 2,
    /// Facing south-east.
    SouthEast = 3,
    /// Facing south.
    South = 4,
    /// Facing south-west.
    SouthWest = 5,
    /// Facing west.
    West = 6,
    /// Facing north-west.
    NorthWest = 7,
}

impl Direction {
    /// Decodes the low three bits of a client byte; the running flag is
    /// ignored.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => Self::North,
            1 => Self::NorthEast,
            2 => Self::East,
            3 => Self::SouthEast,
            4 => Self::South,
            5 => Self::SouthWest,
            6 => Self::West,
            _ => Self::NorthWest,
        }
    }

    /// Tile offset of one step.
    #[must_use]
    pub const fn offset(self) -> (i16, i16) {
        match self {
            Self::North => (0, -1),
            Self::NorthEast => (1, -1),
            Self::East => (1, 0),
            Self::SouthEast => (1, 1),
            Self::South => (0, 1),
            Self::SouthWest => (-1, 1),
            Self::West => (-1, 0),
            Self::NorthWest => (-1, -1),
        }
    }
}

/// Notoriety colour a viewer sees a character in. This is the per-viewer
/// variant that decides whether two observers can share one packet group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Highlight {
    /// Blue.
    #[default]
    Innocent = 1,
    /// Green.
    Ally = 2,
    /// Grey, may be attacked freely.
    Attackable = 3,
    /// Grey, flagged criminal.
    Criminal = 4,
    /// Orange.
    Enemy = 5,
    /// Red.
    Murderer = 6,
    /// Yellow.
    Invulnerable = 7,
}

impl Highlight {
    /// Number of variants.
    pub const COUNT: usize = 7;

    /// Dense index in `0..COUNT`.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize - 1
    }
}

/// Current and maximum hitpoints, mana and stamina.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Vitals {
    /// Current hitpoints.
    pub hits: i16,
    /// Maximum hitpoints.
    pub max_hits: i16,
    /// Current mana.
    pub mana: i16,
    /// Maximum mana.
    pub max_mana: i16,
    /// Current stamina.
    pub stamina: i16,
    /// Maximum stamina.
    pub max_stamina: i16,
}

impl Vitals {
    /// Hitpoints scaled to `0..=100`, as shown to other players.
    #[must_use]
    pub fn hits_percent(&self) -> u16 {
        if self.max_hits <= 0 {
            return 0;
        }
        let hits = i32::from(self.hits.clamp(0, self.max_hits));
        let percent = hits * 100 / i32::from(self.max_hits);
        u16::try_from(percent).unwrap_or(0)
    }
}

/// Core and extended status values shown on a character's own status bar.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Strength.
    pub strength: i16,
    /// Dexterity.
    pub dexterity: i16,
    /// Intelligence.
    pub intelligence: i16,
    /// Female body.
    pub female: bool,
    /// Gold carried.
    pub gold: u32,
    /// Physical resist.
    pub armor: i16,
    /// Carried weight in stones.
    pub weight: u16,
    /// Fire resist.
    pub fire_resist: i16,
    /// Cold resist.
    pub cold_resist: i16,
    /// Poison resist.
    pub poison_resist: i16,
    /// Energy resist.
    pub energy_resist: i16,
    /// Luck.
    pub luck: i16,
    /// Minimum weapon damage.
    pub min_damage: i16,
    /// Maximum weapon damage.
    pub max_damage: i16,
    /// Tithing points.
    pub tithing_points: u32,
}

/// Status flags as sent to clients.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CharFlags(u8);

impl CharFlags {
    /// Cannot move.
    pub const FROZEN: u8 = 0x01;
    /// Female body.
    pub const FEMALE: u8 = 0x02;
    /// Poisoned.
    pub const POISONED: u8 = 0x04;
    /// Combat stance.
    pub const WAR_MODE: u8 = 0x40;
    /// Hidden or invisible.
    pub const HIDDEN: u8 = 0x80;

    /// Wraps raw flag bits.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
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

    /// Returns these flags with `mask` set.
    #[inline]
    #[must_use]
    pub const fn with(self, mask: u8) -> Self {
        Self(self.0 | mask)
    }

    /// Returns these flags with `mask` cleared.
    #[inline]
    #[must_use]
    pub const fn without(self, mask: u8) -> Self {
        Self(self.0 & !mask)
    }

    /// Returns true in war mode.
    #[inline]
    #[must_use]
    pub const fn war_mode(self) -> bool {
        self.contains(Self::WAR_MODE)
    }
}

/// The mount a character rides.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MountView {
    /// The mount's entity id.
    pub id: EntityId,
    /// Item model shown on the rider.
    pub model: u16,
    /// Hue.
    pub color: u16,
}

/// One skill's displayed values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SkillValue {
    /// Modified value, in tenths.
    pub value: u16,
    /// Base value, in tenths.
    pub base: u16,
    /// Cap, in tenths.
    pub cap: u16,
    /// Up/down/locked.
    pub lock: u8,
}

/// Read access to a character.
pub trait CharacterView {
    /// Entity id.
    fn id(&self) -> EntityId;
    /// True once the character has been removed from the world.
    fn is_deleted(&self) -> bool;
    /// Current position.
    fn point(&self) -> Point4;
    /// Display name.
    fn name(&self) -> &str;
    /// Body model.
    fn model(&self) -> u16;
    /// Body hue.
    fn color(&self) -> u16;
    /// Facing direction.
    fn direction(&self) -> Direction;
    /// Status flags.
    fn flags(&self) -> CharFlags;
    /// The ridden mount, if any.
    fn mount(&self) -> Option<MountView>;
    /// Hitpoints, mana and stamina.
    fn vitals(&self) -> Vitals;
    /// Status bar values.
    fn stats(&self) -> Stats;
    /// One skill's values; `None` for an unknown id.
    fn skill(&self, id: u16) -> Option<SkillValue>;

    /// Revision hash of the character's property list, if it has one.
    fn properties_hash(&self) -> Option<u32> {
        None
    }
}

/// Where an item is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemLocation {
    /// Lying on a map.
    Ground(Point4),
    /// Worn by a character.
    Equipped {
        /// The wearer.
        wearer: EntityId,
        /// Equipment layer.
        layer: u8,
    },
    /// Inside a container item.
    Contained {
        /// The container.
        container: EntityId,
        /// Position in the container gump.
        x: u16,
        /// Position in the container gump.
        y: u16,
    },
    /// Nowhere a client can see it (internal storage, limbo).
    Hidden,
}

/// Read access to an item.
pub trait ItemView {
    /// Entity id.
    fn id(&self) -> EntityId;
    /// True once the item has been removed from the world.
    fn is_deleted(&self) -> bool;
    /// Current location.
    fn location(&self) -> ItemLocation;
    /// Item graphic.
    fn model(&self) -> u16;
    /// Hue.
    fn color(&self) -> u16;
    /// Stack amount.
    fn amount(&self) -> u16;

    /// Revision hash of the item's property list, if it has one.
    fn properties_hash(&self) -> Option<u32> {
        None
    }
}

/// Which positions a visibility check uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sightline {
    /// Both entities where they are now.
    Current,
    /// The target as if it still stood at the given point.
    TargetAt(Point4),
    /// The observer as if it still stood at the given point.
    ObserverAt(Point4),
}

/// Result of a visibility check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visibility {
    /// The observer may be told about the target.
    Visible,
    /// The observer must not be told about the target.
    Hidden,
}

impl Visibility {
    /// Returns true for [`Visibility::Visible`].
    #[inline]
    #[must_use]
    pub const fn is_visible(self) -> bool {
        matches!(self, Self::Visible)
    }
}

/// The domain model as seen by the flush passes.
///
/// Range queries append to `out`; callers clear it first.
pub trait SyncWorld {
    /// Looks up a character.
    fn character(&self, id: EntityId) -> Option<&dyn CharacterView>;

    /// Looks up an item.
    fn item(&self, id: EntityId) -> Option<&dyn ItemView>;

    /// Player characters within `range` of `at`.
    fn players_in_range(&self, at: Point4, range: u16, out: &mut Vec<EntityId>);

    /// Characters and ground items within `range` of `at`.
    fn things_in_range(&self, at: Point4, range: u16, out: &mut Vec<EntityId>);

    /// The connected session of a player character.
    fn session(&self, player: EntityId) -> Option<&dyn PacketSink>;

    /// Visibility predicate.
    fn can_see_for_update(&self, observer: EntityId, target: EntityId, sightline: Sightline) -> Visibility;

    /// The colour `viewer` sees `target` in.
    fn highlight_for(&self, target: EntityId, viewer: EntityId) -> Highlight;

    /// True if `viewer` may rename `target` (pets).
    fn can_rename(&self, viewer: EntityId, target: EntityId) -> bool {
        let _ = (viewer, target);
        false
    }

    /// Players that have `container` open.
    fn container_viewers(&self, container: EntityId, out: &mut Vec<EntityId>);

    /// View radius of one player.
    fn update_range(&self, player: EntityId) -> u16 {
        let _ = player;
        MAX_UPDATE_RANGE
    }

    /// Client facet a map is displayed on.
    fn facet_of(&self, map: u8) -> u8 {
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_range_is_square_and_per_map() {
        let a = Point4::new(100, 100, 0, 0);
        assert!(a.in_range(&Point4::new(118, 82, 0, 0), 18));
        assert!(!a.in_range(&Point4::new(119, 100, 0, 0), 18));
        assert!(!a.in_range(&Point4::new(100, 100, 0, 1), 18));
    }

    #[test]
    fn test_direction_bits_and_steps() {
        assert_eq!(Direction::from_bits(0x82), Direction::East);
        let p = Point4::new(10, 10, 0, 1);
        assert_eq!(p.step(Direction::NorthWest), Point4::new(9, 9, 0, 1));
        assert_eq!(Point4::new(0, 0, 0, 0).step(Direction::West), Point4::new(0, 0, 0, 0));
    }

    #[test]
    fn test_hits_percent() {
        let v = Vitals {
            hits: 25,
            max_hits: 50,
            ..Vitals::default()
        };
        assert_eq!(v.hits_percent(), 50);
        assert_eq!(Vitals::default().hits_percent(), 0);
    }

    #[test]
    fn test_highlight_index_is_dense() {
        assert_eq!(Highlight::Innocent.index(), 0);
        assert_eq!(Highlight::Invulnerable.index(), Highlight::COUNT - 1);
    }

    #[test]
    fn test_char_flags() {
        let flags = CharFlags::default().with(CharFlags::WAR_MODE);
        assert!(flags.war_mode());
        assert!(!flags.without(CharFlags::WAR_MODE).war_mode());
        assert_eq!(flags.bits(), 0x40);
    }
}
