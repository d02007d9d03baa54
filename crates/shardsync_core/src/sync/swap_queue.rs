//! # Swap Queue
//!
//! Multi-producer hand-off queue drained by swapping the whole batch out
//! under a short lock.
//!
//! ```text
//!   producers ──push──► [ Mutex<Vec<T>> ] ──swap──► consumer's spare Vec
//!                             │
//!                             └── notify ──► WakeSignal ──► blocked consumer
//! ```
//!
//! The consumer keeps its own spare vector between drains, so steady-state
//! operation never allocates.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;

/// Auto-reset wake event.
///
/// Any number of `notify` calls between two waits collapse into one wake-up.
#[derive(Debug, Clone)]
pub struct WakeSignal {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl WakeSignal {
    /// Creates an unsignalled event.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }

    /// Signals the event. Never blocks.
    #[inline]
    pub fn notify(&self) {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {
                tracing::debug!("wake signal notified after its receiver was dropped");
            }
        }
    }

    /// Blocks until the event is signalled or `timeout` elapses.
    ///
    /// Returns true if the event was signalled.
    pub fn wait(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Consumes a pending signal without blocking.
    pub fn try_consume(&self) -> bool {
        self.rx.try_recv().is_ok()
    }
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue drained by swapping the pending batch out in one step.
#[derive(Debug)]
pub struct SwapQueue<T> {
    pending: Mutex<Vec<T>>,
    wake: WakeSignal,
}

impl<T> SwapQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates an empty queue with room for `capacity` pending items.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pending: Mutex::new(Vec::with_capacity(capacity)),
            wake: WakeSignal::new(),
        }
    }

    /// Appends an item and wakes the consumer.
    pub fn push(&self, item: T) {
        self.pending.lock().push(item);
        self.wake.notify();
    }

    /// Puts a batch back at the head of the queue, keeping its order.
    ///
    /// Used when a consumer has to abandon part of a drained batch.
    pub fn requeue_front<I>(&self, items: I)
    where
        I: IntoIterator<Item = T>,
    {
        let mut pending = self.pending.lock();
        let tail = std::mem::take(&mut *pending);
        pending.extend(items);
        pending.extend(tail);
        drop(pending);
        self.wake.notify();
    }

    /// Swaps the pending batch into `spare`.
    ///
    /// `spare` must be empty; after the call it holds every item pushed since
    /// the previous swap, in push order.
    pub fn swap_into(&self, spare: &mut Vec<T>) {
        debug_assert!(spare.is_empty(), "swap target must be drained first");
        std::mem::swap(&mut *self.pending.lock(), spare);
    }

    /// Blocks until something is pushed or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.wake.wait(timeout)
    }

    /// Wakes a blocked consumer without pushing anything.
    pub fn wake(&self) {
        self.wake.notify();
    }

    /// Returns the number of pending items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

impl<T> Default for SwapQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
