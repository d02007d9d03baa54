//! # Object Pool
//!
//! Thread-safe recycler for objects that are created and dropped every tick.
//!
//! Acquire pops an idle object (or builds a fresh one through the factory),
//! release resets it and pushes it back. The mutex only guards the idle list,
//! never the work done with an acquired object.
//!
//! Release takes the object by value, so an object cannot be handed back
//! twice.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Objects that can be recycled by a [`Pool`].
pub trait Poolable: Send {
    /// Clears per-use state before the object goes back to the idle list.
    fn reset(&mut self);
}

impl<T: Send> Poolable for Vec<T> {
    #[inline]
    fn reset(&mut self) {
        self.clear();
    }
}

/// A thread-safe pool of reusable objects.
///
/// # Example
///
/// ```rust
/// use shardsync_core::memory::Pool;
///
/// let pool: Pool<Vec<u32>> = Pool::new(16, Vec::new);
///
/// let mut scratch = pool.acquire();
/// scratch.push(7);
/// pool.release(scratch);
///
/// // The same allocation comes back, already cleared.
/// assert!(pool.acquire().is_empty());
/// ```
pub struct Pool<T> {
    /// Idle objects ready for reuse.
    idle: Mutex<Vec<T>>,
    /// Builds a new object when the idle list is empty.
    factory: Box<dyn Fn() -> T + Send + Sync>,
    /// Idle objects beyond this count are dropped on release.
    max_idle: usize,
    /// Objects built by the factory so far.
    created: AtomicUsize,
    /// Objects currently handed out.
    outstanding: AtomicUsize,
}

impl<T: Poolable> Pool<T> {
    /// Creates an empty pool.
    ///
    /// # Arguments
    ///
    /// * `max_idle` - Upper bound on the idle list
    /// * `factory` - Builds a fresh object on a pool miss
    #[must_use]
    pub fn new(max_idle: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(max_idle.min(1024))),
            factory: Box::new(factory),
            max_idle,
            created: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Creates a pool and builds `count` idle objects up front.
    #[must_use]
    pub fn with_prefill(
        max_idle: usize,
        count: usize,
        factory: impl Fn() -> T + Send + Sync + 'static,
    ) -> Self {
        let pool = Self::new(max_idle, factory);
        {
            let mut idle = pool.idle.lock();
            for _ in 0..count.min(max_idle) {
                idle.push((pool.factory)());
            }
        }
        pool.created.fetch_add(count.min(max_idle), Ordering::Relaxed);
        pool
    }

    /// Takes an object from the pool, building one if none is idle.
    pub fn acquire(&self) -> T {
        let recycled = self.idle.lock().pop();
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        recycled.unwrap_or_else(|| {
            self.created.fetch_add(1, Ordering::Relaxed);
            (self.factory)()
        })
    }

    /// Resets an object and returns it to the idle list.
    pub fn release(&self, mut value: T) {
        value.reset();
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(value);
        }
    }

    /// Returns the number of idle objects.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Returns how many objects the factory has built.
    #[inline]
    #[must_use]
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Returns how many objects are currently handed out.
    #[inline]
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Returns the idle list bound.
    #[inline]
    #[must_use]
    pub const fn max_idle(&self) -> usize {
        self.max_idle
    }
}

impl<T> std::fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("max_idle", &self.max_idle)
            .field("created", &self.created.load(Ordering::Relaxed))
            .field("outstanding", &self.outstanding.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Default)]
    struct Counter {
        hits: u32,
    }

    impl Poolable for Counter {
        fn reset(&mut self) {
            self.hits = 0;
        }
    }

    #[test]
    fn test_pool_acquire_release() {
        let pool: Pool<Counter> = Pool::new(4, Counter::default);

        let mut c = pool.acquire();
        c.hits = 9;
        assert_eq!(pool.outstanding(), 1);

        pool.release(c);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.idle_count(), 1);

        // Reset ran on release
        assert_eq!(pool.acquire().hits, 0);
        assert_eq!(pool.created_count(), 1);
    }

    #[test]
    fn test_pool_max_idle() {
        let pool: Pool<Counter> = Pool::new(2, Counter::default);
        let items: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        for item in items {
            pool.release(item);
        }
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.created_count(), 5);
    }

    #[test]
    fn test_pool_prefill() {
        let pool: Pool<Vec<u8>> = Pool::with_prefill(8, 3, || Vec::with_capacity(64));
        assert_eq!(pool.idle_count(), 3);
        let v = pool.acquire();
        assert!(v.capacity() >= 64);
        assert_eq!(pool.created_count(), 3);
    }

    #[test]
    fn test_pool_concurrent() {
        let pool: Arc<Pool<Vec<u8>>> = Arc::new(Pool::new(64, Vec::new));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for i in 0..1000u32 {
                        let mut v = pool.acquire();
                        v.push(i.to_le_bytes()[0]);
                        pool.release(v);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.outstanding(), 0);
        assert!(pool.created_count() <= 4);
    }
}
