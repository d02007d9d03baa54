//! # SHARDSYNC Sync
//!
//! Delta sync queues: gameplay code marks what is about to change, the
//! flush once per tick diffs against the snapshots and fans the results out
//! to every observer through shared Packet Groups.
//!
//! ```text
//! hooks (game thread)         flush (end of tick)
//! ───────────────────         ───────────────────
//! about_to_change_*  ─► ChangeTable ─► diff ─► visibility ─► VariantCache ─► sinks
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use shardsync_net::PacketGroupPool;
//! use shardsync_sync::{CharSyncQueue, ItemSyncQueue, SyncConfig};
//!
//! let groups = PacketGroupPool::default();
//! let chars = CharSyncQueue::new(groups.clone(), SyncConfig::default())?;
//! let items = ItemSyncQueue::new(groups, SyncConfig::default());
//!
//! chars.about_to_change_hitpoints(&player);
//! player.hits -= 5;
//!
//! chars.flush(&world)?;
//! items.flush(&world)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod character;
pub mod config;
pub mod error;
mod fanout;
pub mod item;
pub mod packets;
pub mod prepared;
pub mod queue;
pub mod world;

pub use character::{ChangeFlags, ChangeMask, CharChangeState, CharSyncQueue, MovementBits};
pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use fanout::FlushStats;
pub use item::{send_item_info, ItemChangeState, ItemSyncFlags, ItemSyncQueue};
pub use prepared::PreparedGroups;
pub use queue::{ChangeRecord, ChangeTable};
pub use world::{
    CharFlags, CharacterView, Direction, EntityId, Highlight, ItemLocation, ItemView, MountView, Point4, Sightline,
    SkillValue, Stats, SyncWorld, Visibility, Vitals,
};
