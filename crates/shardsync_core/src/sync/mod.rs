//! # Cross-Thread Hand-off
//!
//! Every producer/consumer boundary (outgoing sends, decoded incoming
//! packets, pending entity changes) uses the same pattern: push under a
//! short lock, signal, and let the consumer swap the whole batch out.

mod swap_queue;

pub use swap_queue::{SwapQueue, WakeSignal};
