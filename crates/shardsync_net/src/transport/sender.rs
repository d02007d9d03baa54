//! # Sender Threads
//!
//! A fixed pool of OS threads turns queued sends into socket frames:
//! compress (once per group), encrypt (per connection), hand to the
//! connection's write task.
//!
//! Each thread owns one lane of the outgoing queue. A connection always
//! maps to the same lane, so its frames are encrypted and written in the
//! order they were queued.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use super::connection::{ConnectionState, OutboundFrame};
use super::{EngineShared, OutgoingMessage};
use crate::protocol::GroupError;

/// Worker loop for lane `lane`; returns when the stop flag is set.
pub(crate) fn run<S: ConnectionState>(shared: Arc<EngineShared<S>>, lane: usize) {
    let poll = Duration::from_millis(shared.config.stop_poll_ms.max(1));
    let queue = &shared.outgoing[lane];
    let mut batch = Vec::with_capacity(64);
    let mut frames = 0u64;

    tracing::debug!(lane, "sender thread started");

    loop {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        queue.swap_into(&mut batch);
        if batch.is_empty() {
            queue.wait(poll);
            continue;
        }

        for message in batch.drain(..) {
            if send_one(&shared, message) {
                frames += 1;
            }
        }
    }

    // Tickets in anything left behind complete on drop.
    queue.swap_into(&mut batch);
    let abandoned = batch.len();
    batch.clear();

    tracing::debug!(lane, frames, abandoned, "sender thread stopped");
}

/// Returns true if a frame reached the write task.
fn send_one<S: ConnectionState>(shared: &EngineShared<S>, message: OutgoingMessage<S>) -> bool {
    let OutgoingMessage { conn, ticket } = message;
    if conn.is_closed() {
        return false;
    }

    let sealed = ticket
        .group()
        .with_final_bytes(shared.compressor.as_deref(), |bytes| conn.seal_frame(bytes));

    match sealed {
        Ok(Ok(bytes)) => {
            conn.dispatch(OutboundFrame { bytes, ticket });
            true
        }
        Ok(Err(e)) => {
            conn.close(e.to_string());
            false
        }
        Err(GroupError::Codec(e)) => {
            conn.close(format!("compression failed: {e}"));
            false
        }
        Err(GroupError::Sanity(_)) => false,
    }
}
