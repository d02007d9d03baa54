//! # Change Table
//!
//! The pending side of a sync queue: a FIFO of dirty entity ids plus a side
//! table holding each entity's change-state.
//!
//! ```text
//!   mark(id) ──► states: HashMap<EntityId, T> ──(first mark)──► pending FIFO
//!                                                                  │
//!   flush ◄── swap batch ◄─────────────────────────────────────────┘
//!     └── detach state ──► process ──► release to pool
//! ```
//!
//! An entity has at most one attached state between two flushes; marking it
//! again reuses that state and never enqueues it twice.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use shardsync_core::{ensure, Pool, Poolable, SanityResult, SanityViolation, SwapQueue};

use crate::error::{SyncError, SyncResult};
use crate::world::EntityId;

/// A pooled change-state bound to one entity at a time.
pub trait ChangeRecord: Poolable {
    /// The entity this state belongs to.
    fn entity(&self) -> EntityId;

    /// Binds a freshly acquired state to `id`.
    fn bind(&mut self, id: EntityId);
}

/// Pending entities and their change-states.
pub struct ChangeTable<T> {
    name: &'static str,
    pending: SwapQueue<EntityId>,
    states: Mutex<HashMap<EntityId, T>>,
    pool: Pool<T>,
    enabled: AtomicBool,
    spare: Mutex<Vec<EntityId>>,
}

impl<T: ChangeRecord> ChangeTable<T> {
    /// Creates an empty, enabled table.
    ///
    /// # Arguments
    ///
    /// * `name` - Used in logs and sanity messages
    /// * `max_idle` - Idle states kept by the pool
    /// * `factory` - Builds a fresh state on a pool miss
    #[must_use]
    pub fn new(name: &'static str, max_idle: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            name,
            pending: SwapQueue::new(),
            states: Mutex::new(HashMap::new()),
            pool: Pool::new(max_idle, factory),
            enabled: AtomicBool::new(true),
            spare: Mutex::new(Vec::new()),
        }
    }

    /// Runs `f` on the entity's state, attaching and enqueueing one first if
    /// the entity is not pending yet.
    ///
    /// Returns `None` without touching anything while the table is disabled.
    /// May be called from inside [`Self::flush_with`]; the entity then goes
    /// out with the next flush.
    pub fn mark<R>(&self, id: EntityId, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        if !self.is_enabled() {
            return None;
        }
        let mut states = self.states.lock();
        let (state, fresh) = match states.entry(id) {
            Entry::Occupied(entry) => (entry.into_mut(), false),
            Entry::Vacant(entry) => {
                let mut state = self.pool.acquire();
                state.bind(id);
                (entry.insert(state), true)
            }
        };
        let result = f(state);
        drop(states);

        if fresh {
            self.pending.push(id);
        }
        Some(result)
    }

    /// Returns true if `id` has a state attached.
    #[must_use]
    pub fn is_pending(&self, id: EntityId) -> bool {
        self.states.lock().contains_key(&id)
    }

    /// Reads the attached state of `id`, if any.
    pub fn inspect<R>(&self, id: EntityId, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.states.lock().get(&id).map(f)
    }

    /// Turns marking on or off. Already pending entities stay queued.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Returns true while marks are recorded.
    #[inline]
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Number of entities waiting for the next flush.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of attached change-states.
    #[must_use]
    pub fn attached(&self) -> usize {
        self.states.lock().len()
    }

    /// Blocks until an entity is enqueued or `timeout` elapses.
    pub fn wait_pending(&self, timeout: Duration) -> bool {
        self.pending.wait(timeout)
    }

    /// Drains the pending batch, handing each detached state to `process`.
    ///
    /// Each state goes back to the pool after processing. On the first
    /// violation the rest of the batch is put back at the front of the queue
    /// and the violation is returned as [`SyncError::FlushAborted`].
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::FlushAborted`] if a queued id has no state, a
    /// state is bound to another entity, or `process` fails.
    pub fn flush_with<F>(&self, mut process: F) -> SyncResult<usize>
    where
        F: FnMut(&T) -> SanityResult<()>,
    {
        let mut batch = std::mem::take(&mut *self.spare.lock());
        self.pending.swap_into(&mut batch);

        let mut processed = 0;
        let mut failure = None;
        let mut ids = batch.drain(..);
        for id in ids.by_ref() {
            let result = match self.detach(id) {
                Ok(state) => {
                    let result = ensure(state.entity() == id, self.name, || {
                        format!("state queued for {id} is bound to {}", state.entity())
                    })
                    .and_then(|()| process(&state));
                    self.pool.release(state);
                    result
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                failure = Some((id, e));
                break;
            }
            processed += 1;
        }
        let rest: Vec<EntityId> = ids.collect();
        *self.spare.lock() = batch;

        match failure {
            None => Ok(processed),
            Some((entity, source)) => {
                let requeued = rest.len();
                self.pending.requeue_front(rest);
                Err(SyncError::FlushAborted {
                    entity,
                    requeued,
                    source,
                })
            }
        }
    }

    fn detach(&self, id: EntityId) -> SanityResult<T> {
        self.states
            .lock()
            .remove(&id)
            .ok_or_else(|| SanityViolation::new(self.name, format!("queued id {id} has no state")))
    }
}

impl<T> std::fmt::Debug for ChangeTable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeTable")
            .field("name", &self.name)
            .field("pending", &self.pending.len())
            .field("enabled", &self.enabled.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Marks {
        entity: EntityId,
        count: u32,
    }

    impl Poolable for Marks {
        fn reset(&mut self) {
            self.count = 0;
        }
    }

    impl ChangeRecord for Marks {
        fn entity(&self) -> EntityId {
            self.entity
        }

        fn bind(&mut self, id: EntityId) {
            self.entity = id;
        }
    }

    fn table() -> ChangeTable<Marks> {
        ChangeTable::new("test queue", 8, Marks::default)
    }

    #[test]
    fn test_mark_is_idempotent() {
        let t = table();
        for _ in 0..3 {
            t.mark(EntityId(1), |m| m.count += 1);
        }
        t.mark(EntityId(2), |m| m.count += 1);

        assert_eq!(t.pending_len(), 2);
        assert_eq!(t.attached(), 2);
        assert_eq!(t.inspect(EntityId(1), |m| m.count), Some(3));
    }

    #[test]
    fn test_flush_detaches_and_recycles() {
        let t = table();
        t.mark(EntityId(1), |m| m.count += 1);
        t.mark(EntityId(2), |m| m.count += 1);

        let mut seen = Vec::new();
        let processed = t.flush_with(|m| {
            seen.push(m.entity);
            Ok(())
        });

        assert_eq!(processed, Ok(2));
        assert_eq!(seen, [EntityId(1), EntityId(2)]);
        assert_eq!(t.attached(), 0);
        assert!(!t.is_pending(EntityId(1)));

        t.mark(EntityId(1), |m| assert_eq!(m.count, 0));
        assert_eq!(t.pending_len(), 1);
    }

    #[test]
    fn test_disabled_table_ignores_marks() {
        let t = table();
        t.set_enabled(false);
        assert_eq!(t.mark(EntityId(1), |m| m.count += 1), None);
        assert_eq!(t.pending_len(), 0);
    }

    #[test]
    fn test_failure_requeues_rest_in_order() {
        let t = table();
        for id in 1..=4 {
            t.mark(EntityId(id), |_| ());
        }

        let err = t
            .flush_with(|m| {
                if m.entity == EntityId(2) {
                    Err(SanityViolation::new("test", "boom"))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::FlushAborted {
                entity: EntityId(2),
                requeued: 2,
                ..
            }
        ));

        let mut seen = Vec::new();
        t.flush_with(|m| {
            seen.push(m.entity);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, [EntityId(3), EntityId(4)]);
    }
}
