//! # Sync Packets
//!
//! Outgoing packets emitted by the flush passes. Each one captures the
//! values it needs when it is built, so a group can be serialized long
//! after the entity moved on.
//!
//! | id     | packet               | built for                    |
//! |--------|----------------------|------------------------------|
//! | `0x11` | [`StatusBar`]        | own bar, pet bar, other bar  |
//! | `0x1a` | [`GroundItem`]       | items on the ground          |
//! | `0x1d` | [`DeleteObject`]     | view removal                 |
//! | `0x20` | [`DrawPlayer`]       | the player's own body        |
//! | `0x25` | [`ContainerItem`]    | items in an open container   |
//! | `0x2d` | [`MobAttributes`]    | all three vitals at once     |
//! | `0x2e` | [`WornItem`]         | equipment and mounts         |
//! | `0x3a` | [`SkillUpdate`]      | one skill                    |
//! | `0x72` | [`SetWarMode`]       | war mode toggle              |
//! | `0x77` | [`UpdatePlayer`]     | movement seen by observers   |
//! | `0x78` | [`DrawObject`]       | introducing a character      |
//! | `0xa1` | [`UpdateVital`]      | hitpoints (also `0xa2`/`0xa3`) |
//! | `0xbf` | [`SetFacet`]         | facet change                 |
//! | `0xdc` | [`PropertiesRevision`] | property list revision     |

use bytemuck::{Pod, Zeroable};
use shardsync_net::{OutgoingPacket, PacketWriter};

use crate::world::{
    CharacterView, Direction, EntityId, Highlight, ItemView, MountView, Point4, SkillValue, Stats, Vitals,
};

/// Equipment layer mounts are shown on.
pub const MOUNT_LAYER: u8 = 0x19;

/// Serial flag marking the mount item of a rider.
pub const MOUNT_SERIAL_FLAG: u32 = 0x4000_0000;

/// Width of fixed name fields.
const NAME_WIDTH: usize = 30;

#[inline]
fn running_direction(direction: Direction, running: bool) -> u8 {
    direction as u8 | if running { 0x80 } else { 0 }
}

// ============================================================================
// CHARACTERS
// ============================================================================

/// `0x20`: the player's own body, position and flags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrawPlayer {
    serial: u32,
    model: u16,
    color: u16,
    flags: u8,
    point: Point4,
    direction: Direction,
}

impl DrawPlayer {
    /// Captures `ch`.
    #[must_use]
    pub fn new(ch: &dyn CharacterView) -> Self {
        Self {
            serial: ch.id().raw(),
            model: ch.model(),
            color: ch.color(),
            flags: ch.flags().bits(),
            point: ch.point(),
            direction: ch.direction(),
        }
    }
}

impl OutgoingPacket for DrawPlayer {
    fn id(&self) -> u8 {
        0x20
    }

    fn write_body(&self, w: &mut PacketWriter<'_>) {
        w.write_u32(self.serial);
        w.write_u16(self.model);
        w.write_u8(0);
        w.write_u16(self.color);
        w.write_u8(self.flags);
        w.write_u16(self.point.x);
        w.write_u16(self.point.y);
        w.write_u16(0);
        w.write_u8(self.direction as u8);
        w.write_i8(self.point.z);
    }

    fn name(&self) -> &'static str {
        "DrawPlayer"
    }
}

/// `0x78`: introduces a character to a viewer, in the viewer's highlight.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrawObject {
    serial: u32,
    model: u16,
    point: Point4,
    direction: Direction,
    color: u16,
    flags: u8,
    highlight: Highlight,
    mount: Option<MountView>,
}

impl DrawObject {
    /// Captures `ch` as seen in `highlight`.
    #[must_use]
    pub fn new(ch: &dyn CharacterView, highlight: Highlight) -> Self {
        Self {
            serial: ch.id().raw(),
            model: ch.model(),
            point: ch.point(),
            direction: ch.direction(),
            color: ch.color(),
            flags: ch.flags().bits(),
            highlight,
            mount: ch.mount(),
        }
    }
}

impl OutgoingPacket for DrawObject {
    fn id(&self) -> u8 {
        0x78
    }

    fn write_body(&self, w: &mut PacketWriter<'_>) {
        let slot = w.reserve_length();
        w.write_u32(self.serial);
        w.write_u16(self.model);
        w.write_u16(self.point.x);
        w.write_u16(self.point.y);
        w.write_i8(self.point.z);
        w.write_u8(self.direction as u8);
        w.write_u16(self.color);
        w.write_u8(self.flags);
        w.write_u8(self.highlight as u8);
        if let Some(mount) = self.mount {
            w.write_u32(mount.id.raw() | MOUNT_SERIAL_FLAG);
            w.write_u16(mount.model | 0x8000);
            w.write_u8(MOUNT_LAYER);
            w.write_u16(mount.color);
        }
        w.write_u32(0);
        w.commit_length(slot);
    }

    fn name(&self) -> &'static str {
        "DrawObject"
    }
}

/// `0x77`: movement, facing or appearance change of a visible character.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdatePlayer {
    serial: u32,
    model: u16,
    point: Point4,
    direction: Direction,
    running: bool,
    color: u16,
    flags: u8,
    highlight: Highlight,
}

impl UpdatePlayer {
    /// Captures `ch` as seen in `highlight`.
    #[must_use]
    pub fn new(ch: &dyn CharacterView, running: bool, highlight: Highlight) -> Self {
        Self {
            serial: ch.id().raw(),
            model: ch.model(),
            point: ch.point(),
            direction: ch.direction(),
            running,
            color: ch.color(),
            flags: ch.flags().bits(),
            highlight,
        }
    }
}

impl OutgoingPacket for UpdatePlayer {
    fn id(&self) -> u8 {
        0x77
    }

    fn write_body(&self, w: &mut PacketWriter<'_>) {
        w.write_u32(self.serial);
        w.write_u16(self.model);
        w.write_u16(self.point.x);
        w.write_u16(self.point.y);
        w.write_i8(self.point.z);
        w.write_u8(running_direction(self.direction, self.running));
        w.write_u16(self.color);
        w.write_u8(self.flags);
        w.write_u8(self.highlight as u8);
    }

    fn name(&self) -> &'static str {
        "UpdatePlayer"
    }
}

/// `0x1d`: removes an object from the client's view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeleteObject {
    serial: u32,
}

impl DeleteObject {
    /// Removes `id`.
    #[must_use]
    pub const fn new(id: EntityId) -> Self {
        Self { serial: id.raw() }
    }

    /// Removes the mount item shown on a rider.
    #[must_use]
    pub const fn mount(mount: EntityId) -> Self {
        Self {
            serial: mount.raw() | MOUNT_SERIAL_FLAG,
        }
    }
}

impl OutgoingPacket for DeleteObject {
    fn id(&self) -> u8 {
        0x1d
    }

    fn write_body(&self, w: &mut PacketWriter<'_>) {
        w.write_u32(self.serial);
    }

    fn name(&self) -> &'static str {
        "DeleteObject"
    }
}

// ============================================================================
// STATUS
// ============================================================================

/// Which status bar a [`StatusBar`] fills.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusBarKind {
    /// The player's own bar, with exact values and stats.
    Me,
    /// A bar the viewer may rename.
    Pet,
    /// Anyone else's bar, hitpoints as a percentage.
    Other,
}

/// `0x11`: status bar.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusBar {
    kind: StatusBarKind,
    serial: u32,
    name: String,
    vitals: Vitals,
    stats: Stats,
}

impl StatusBar {
    /// Captures `ch` for a `kind` bar.
    #[must_use]
    pub fn new(ch: &dyn CharacterView, kind: StatusBarKind) -> Self {
        Self {
            kind,
            serial: ch.id().raw(),
            name: ch.name().to_owned(),
            vitals: ch.vitals(),
            stats: ch.stats(),
        }
    }

    /// Returns the captured name.
    #[must_use]
    pub fn char_name(&self) -> &str {
        &self.name
    }
}

impl OutgoingPacket for StatusBar {
    fn id(&self) -> u8 {
        0x11
    }

    fn write_body(&self, w: &mut PacketWriter<'_>) {
        let slot = w.reserve_length();
        w.write_u32(self.serial);
        w.write_ascii_fixed(&self.name, NAME_WIDTH);
        match self.kind {
            StatusBarKind::Me => {
                w.write_i16(self.vitals.hits);
                w.write_i16(self.vitals.max_hits);
                w.write_bool(false);
                w.write_u8(4);
                let s = &self.stats;
                w.write_bool(s.female);
                w.write_i16(s.strength);
                w.write_i16(s.dexterity);
                w.write_i16(s.intelligence);
                w.write_i16(self.vitals.stamina);
                w.write_i16(self.vitals.max_stamina);
                w.write_i16(self.vitals.mana);
                w.write_i16(self.vitals.max_mana);
                w.write_u32(s.gold);
                w.write_i16(s.armor);
                w.write_u16(s.weight);
                w.write_i16(s.fire_resist);
                w.write_i16(s.cold_resist);
                w.write_i16(s.poison_resist);
                w.write_i16(s.energy_resist);
                w.write_i16(s.luck);
                w.write_i16(s.min_damage);
                w.write_i16(s.max_damage);
                w.write_u32(s.tithing_points);
            }
            StatusBarKind::Pet | StatusBarKind::Other => {
                w.write_u16(self.vitals.hits_percent());
                w.write_u16(100);
                w.write_bool(self.kind == StatusBarKind::Pet);
                w.write_u8(0);
            }
        }
        w.commit_length(slot);
    }

    fn name(&self) -> &'static str {
        "StatusBar"
    }
}

/// Big-endian wire image of [`MobAttributes`].
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
struct AttributesWire {
    serial: [u8; 4],
    max_hits: [u8; 2],
    hits: [u8; 2],
    max_mana: [u8; 2],
    mana: [u8; 2],
    max_stamina: [u8; 2],
    stamina: [u8; 2],
}

/// `0x2d`: all three vitals in one packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MobAttributes {
    serial: u32,
    vitals: Vitals,
}

impl MobAttributes {
    /// Captures `ch`'s vitals.
    #[must_use]
    pub fn new(ch: &dyn CharacterView) -> Self {
        Self {
            serial: ch.id().raw(),
            vitals: ch.vitals(),
        }
    }
}

impl OutgoingPacket for MobAttributes {
    fn id(&self) -> u8 {
        0x2d
    }

    fn write_body(&self, w: &mut PacketWriter<'_>) {
        let v = &self.vitals;
        w.write_pod(&AttributesWire {
            serial: self.serial.to_be_bytes(),
            max_hits: v.max_hits.to_be_bytes(),
            hits: v.hits.to_be_bytes(),
            max_mana: v.max_mana.to_be_bytes(),
            mana: v.mana.to_be_bytes(),
            max_stamina: v.max_stamina.to_be_bytes(),
            stamina: v.stamina.to_be_bytes(),
        });
    }

    fn name(&self) -> &'static str {
        "MobAttributes"
    }
}

/// Which vital an [`UpdateVital`] carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum VitalKind {
    /// `0xa1`
    Hits = 0xa1,
    /// `0xa2`
    Mana = 0xa2,
    /// `0xa3`
    Stamina = 0xa3,
}

/// `0xa1`/`0xa2`/`0xa3`: one vital.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpdateVital {
    kind: VitalKind,
    serial: u32,
    max: u16,
    current: u16,
}

impl UpdateVital {
    /// The exact value, for the character's own client.
    #[must_use]
    pub fn exact(ch: &dyn CharacterView, kind: VitalKind) -> Self {
        let v = ch.vitals();
        let (current, max) = match kind {
            VitalKind::Hits => (v.hits, v.max_hits),
            VitalKind::Mana => (v.mana, v.max_mana),
            VitalKind::Stamina => (v.stamina, v.max_stamina),
        };
        Self {
            kind,
            serial: ch.id().raw(),
            max: u16::try_from(max).unwrap_or(0),
            current: u16::try_from(current).unwrap_or(0),
        }
    }

    /// Hitpoints as a percentage, for everyone else.
    #[must_use]
    pub fn hits_percent(ch: &dyn CharacterView) -> Self {
        Self {
            kind: VitalKind::Hits,
            serial: ch.id().raw(),
            max: 100,
            current: ch.vitals().hits_percent(),
        }
    }
}

impl OutgoingPacket for UpdateVital {
    fn id(&self) -> u8 {
        self.kind as u8
    }

    fn write_body(&self, w: &mut PacketWriter<'_>) {
        w.write_u32(self.serial);
        w.write_u16(self.max);
        w.write_u16(self.current);
    }

    fn name(&self) -> &'static str {
        match self.kind {
            VitalKind::Hits => "UpdateHits",
            VitalKind::Mana => "UpdateMana",
            VitalKind::Stamina => "UpdateStamina",
        }
    }
}

/// `0x3a`: one skill, with its cap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SkillUpdate {
    skill: u16,
    value: SkillValue,
}

impl SkillUpdate {
    /// Captures one skill.
    #[must_use]
    pub const fn new(skill: u16, value: SkillValue) -> Self {
        Self { skill, value }
    }
}

impl OutgoingPacket for SkillUpdate {
    fn id(&self) -> u8 {
        0x3a
    }

    fn write_body(&self, w: &mut PacketWriter<'_>) {
        let slot = w.reserve_length();
        w.write_u8(0xdf);
        w.write_u16(self.skill);
        w.write_u16(self.value.value);
        w.write_u16(self.value.base);
        w.write_u8(self.value.lock);
        w.write_u16(self.value.cap);
        w.commit_length(slot);
    }

    fn name(&self) -> &'static str {
        "SkillUpdate"
    }
}

/// `0x72`: war mode on or off.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetWarMode(pub bool);

impl OutgoingPacket for SetWarMode {
    fn id(&self) -> u8 {
        0x72
    }

    fn write_body(&self, w: &mut PacketWriter<'_>) {
        w.write_bool(self.0);
        w.write_u8(0);
        w.write_u8(0x32);
        w.write_u8(0);
    }

    fn name(&self) -> &'static str {
        "SetWarMode"
    }
}

/// `0xbf` subcommand `0x08`: switch the client's facet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetFacet(pub u8);

impl OutgoingPacket for SetFacet {
    fn id(&self) -> u8 {
        0xbf
    }

    fn write_body(&self, w: &mut PacketWriter<'_>) {
        let slot = w.reserve_length();
        w.write_u16(0x08);
        w.write_u8(self.0);
        w.commit_length(slot);
    }

    fn name(&self) -> &'static str {
        "SetFacet"
    }
}

/// `0xdc`: tells the client which property list revision is current.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PropertiesRevision {
    serial: u32,
    hash: u32,
}

impl PropertiesRevision {
    /// Revision `hash` of `id`'s property list.
    #[must_use]
    pub const fn new(id: EntityId, hash: u32) -> Self {
        Self { serial: id.raw(), hash }
    }
}

impl OutgoingPacket for PropertiesRevision {
    fn id(&self) -> u8 {
        0xdc
    }

    fn write_body(&self, w: &mut PacketWriter<'_>) {
        w.write_u32(self.serial);
        w.write_u32(self.hash);
    }

    fn name(&self) -> &'static str {
        "PropertiesRevision"
    }
}

// ============================================================================
// ITEMS
// ============================================================================

/// `0x1a`: an item lying on the ground.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroundItem {
    serial: u32,
    model: u16,
    amount: u16,
    point: Point4,
    color: u16,
}

impl GroundItem {
    /// Captures `item` lying at `point`.
    #[must_use]
    pub fn new(item: &dyn ItemView, point: Point4) -> Self {
        Self {
            serial: item.id().raw(),
            model: item.model(),
            amount: item.amount(),
            point,
            color: item.color(),
        }
    }
}

impl OutgoingPacket for GroundItem {
    fn id(&self) -> u8 {
        0x1a
    }

    fn write_body(&self, w: &mut PacketWriter<'_>) {
        let slot = w.reserve_length();
        let stacked = self.amount > 1;
        w.write_u32(self.serial | if stacked { 0x8000_0000 } else { 0 });
        w.write_u16(self.model);
        if stacked {
            w.write_u16(self.amount);
        }
        w.write_u16(self.point.x);
        w.write_u16(self.point.y | 0xc000);
        w.write_i8(self.point.z);
        w.write_u16(self.color);
        w.write_u8(0);
        w.commit_length(slot);
    }

    fn name(&self) -> &'static str {
        "GroundItem"
    }
}

/// `0x2e`: an item worn on a visible layer, or a rider's mount.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WornItem {
    serial: u32,
    model: u16,
    layer: u8,
    wearer: u32,
    color: u16,
}

impl WornItem {
    /// Captures `item` worn by `wearer` on `layer`.
    #[must_use]
    pub fn item(item: &dyn ItemView, wearer: EntityId, layer: u8) -> Self {
        Self {
            serial: item.id().raw(),
            model: item.model(),
            layer,
            wearer: wearer.raw(),
            color: item.color(),
        }
    }

    /// The mount item shown on `rider`.
    #[must_use]
    pub const fn mount(rider: EntityId, mount: MountView) -> Self {
        Self {
            serial: mount.id.raw() | MOUNT_SERIAL_FLAG,
            model: mount.model,
            layer: MOUNT_LAYER,
            wearer: rider.raw(),
            color: mount.color,
        }
    }
}

impl OutgoingPacket for WornItem {
    fn id(&self) -> u8 {
        0x2e
    }

    fn write_body(&self, w: &mut PacketWriter<'_>) {
        w.write_u32(self.serial);
        w.write_u16(self.model);
        w.write_u8(0);
        w.write_u8(self.layer);
        w.write_u32(self.wearer);
        w.write_u16(self.color);
    }

    fn name(&self) -> &'static str {
        "WornItem"
    }
}

/// `0x25`: an item inside an open container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContainerItem {
    serial: u32,
    model: u16,
    amount: u16,
    x: u16,
    y: u16,
    container: u32,
    color: u16,
}

impl ContainerItem {
    /// Captures `item` at (`x`, `y`) inside `container`.
    #[must_use]
    pub fn new(item: &dyn ItemView, container: EntityId, x: u16, y: u16) -> Self {
        Self {
            serial: item.id().raw(),
            model: item.model(),
            amount: item.amount(),
            x,
            y,
            container: container.raw(),
            color: item.color(),
        }
    }
}

impl OutgoingPacket for ContainerItem {
    fn id(&self) -> u8 {
        0x25
    }

    fn write_body(&self, w: &mut PacketWriter<'_>) {
        w.write_u32(self.serial);
        w.write_u16(self.model);
        w.write_u8(0);
        w.write_u16(self.amount.max(1));
        w.write_u16(self.x);
        w.write_u16(self.y);
        w.write_u32(self.container);
        w.write_u16(self.color);
    }

    fn name(&self) -> &'static str {
        "ContainerItem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{CharFlags, SkillValue};
    use shardsync_net::write_packet;

    struct Bob;

    impl CharacterView for Bob {
        fn id(&self) -> EntityId {
            EntityId(0x0000_0102)
        }
        fn is_deleted(&self) -> bool {
            false
        }
        fn point(&self) -> Point4 {
            Point4::new(1000, 2000, 5, 0)
        }
        fn name(&self) -> &str {
            "Bob"
        }
        fn model(&self) -> u16 {
            0x190
        }
        fn color(&self) -> u16 {
            0x83ea
        }
        fn direction(&self) -> Direction {
            Direction::East
        }
        fn flags(&self) -> CharFlags {
            CharFlags::default()
        }
        fn mount(&self) -> Option<MountView> {
            Some(MountView {
                id: EntityId(0x77),
                model: 0x3ea2,
                color: 0,
            })
        }
        fn vitals(&self) -> Vitals {
            Vitals {
                hits: 30,
                max_hits: 60,
                mana: 1,
                max_mana: 2,
                stamina: 3,
                max_stamina: 4,
            }
        }
        fn stats(&self) -> Stats {
            Stats::default()
        }
        fn skill(&self, _id: u16) -> Option<SkillValue> {
            None
        }
    }

    fn bytes(p: &dyn OutgoingPacket) -> Vec<u8> {
        let mut out = Vec::new();
        write_packet(p, &mut out).unwrap();
        out
    }

    #[test]
    fn test_status_bar_carries_name_and_length() {
        let out = bytes(&StatusBar::new(&Bob, StatusBarKind::Other));
        assert_eq!(out[0], 0x11);
        assert_eq!(usize::from(u16::from_be_bytes([out[1], out[2]])), out.len());
        assert_eq!(&out[7..10], b"Bob");
        assert_eq!(out[10], 0);
    }

    #[test]
    fn test_attributes_are_big_endian() {
        let out = bytes(&MobAttributes::new(&Bob));
        assert_eq!(out.len(), 17);
        assert_eq!(&out[1..5], &[0, 0, 1, 2]);
        assert_eq!(&out[5..9], &[0, 60, 0, 30]);
    }

    #[test]
    fn test_draw_object_includes_mount_and_terminator() {
        let out = bytes(&DrawObject::new(&Bob, Highlight::Murderer));
        assert_eq!(out[0], 0x78);
        assert_eq!(out[18], Highlight::Murderer as u8);
        assert_eq!(&out[19..23], &(0x77 | MOUNT_SERIAL_FLAG).to_be_bytes());
        assert_eq!(&out[out.len() - 4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_hits_percent_for_observers() {
        let out = bytes(&UpdateVital::hits_percent(&Bob));
        assert_eq!(out, vec![0xa1, 0, 0, 1, 2, 0, 100, 0, 50]);
    }

    #[test]
    fn test_running_sets_high_bit() {
        let out = bytes(&UpdatePlayer::new(&Bob, true, Highlight::Innocent));
        assert_eq!(out[12], 0x82);
    }
}
