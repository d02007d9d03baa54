//! # SHARDSYNC Core
//!
//! Shared plumbing for the sync and transport layers:
//! - Thread-safe object pools with reset-on-release
//! - Pooled byte buffers
//! - Swap queues and auto-reset wake signals for cross-thread hand-off
//! - The sanity signal raised on invariant violations
//!
//! ## Architecture Rules
//!
//! 1. **Pools, not allocators** - per-tick objects are borrowed and returned
//! 2. **Short locks** - a lock guards a push, a pop or a swap, never the work
//! 3. **Loud invariants** - violations are logged and propagated, never ignored
//!
//! ## Example
//!
//! ```rust
//! use shardsync_core::{BufferPool, SwapQueue};
//!
//! let buffers = BufferPool::new(1024, 32);
//! let queue = SwapQueue::new();
//!
//! let mut buf = buffers.acquire();
//! buf.extend_from_slice(b"hello");
//! queue.push(buf);
//!
//! let mut batch = Vec::new();
//! queue.swap_into(&mut batch);
//! for buf in batch.drain(..) {
//!     buffers.release(buf);
//! }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod memory;
pub mod sanity;
pub mod sync;

pub use memory::{Buffer, BufferPool, Pool, Poolable, DEFAULT_BUFFER_LEN};
pub use sanity::{ensure, SanityResult, SanityViolation};
pub use sync::{SwapQueue, WakeSignal};
