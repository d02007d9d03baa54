//! # SHARDSYNC
//!
//! Real-time state sync and transport for a multiplayer world server.
//!
//! | Crate             | Concern                                              |
//! |-------------------|------------------------------------------------------|
//! | `shardsync_core`  | pools, buffers, swap queues, sanity violations       |
//! | `shardsync_net`   | packet groups, transport engine, server/client roles |
//! | `shardsync_sync`  | change tracking and visibility fan-out               |
//! | `shardsync`       | this crate: runtime wiring, tick loop, config        |
//!
//! ## Tick
//!
//! ```text
//! ShardRuntime::tick
//!   ├─ engine.cycle()        decoded packets → handlers
//!   ├─ update(world, ...)    game logic + about_to_change_* hooks
//!   ├─ chars.flush(world)    diffs → shared groups → sessions
//!   └─ items.flush(world)
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod error;
pub mod runtime;
pub mod tick;

pub use config::ShardConfig;
pub use error::{ConfigError, RuntimeError, RuntimeResult};
pub use runtime::{ShardRuntime, TickReport};
pub use tick::{TickLoop, TickStats};

pub use shardsync_core;
pub use shardsync_net;
pub use shardsync_sync;
