//! # Memory Management
//!
//! Recycled objects and byte buffers for allocation-free ticks.
//!
//! ## Design Philosophy
//!
//! Objects that live for one flush or one send are borrowed from a pool and
//! returned when the work completes:
//! - change-states live for one flush
//! - packet group scratch buffers live until the group is disposed
//! - send buffers live until the socket write completes

mod buffer;
mod pool;

pub use buffer::{Buffer, BufferPool, DEFAULT_BUFFER_LEN};
pub use pool::{Pool, Poolable};
