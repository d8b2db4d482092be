use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Clears per-use state before an object goes back on the free list.
pub(crate) trait Recycle {
    fn recycle(&mut self);
}

impl<T: Recycle> Recycle for Box<T> {
    fn recycle(&mut self) {
        (**self).recycle();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct PoolStats {
    pub(crate) allocated: u64,
    pub(crate) reused: u64,
    pub(crate) dropped: u64,
}

/// Free list of reusable objects shared by every caller and worker.
///
/// An object is owned by exactly one borrower between `acquire` and `release`.
/// Objects that are never released (abandoned requests) are simply dropped.
pub(crate) struct ObjectPool<T: Recycle> {
    idle: Mutex<Vec<T>>,
    max_idle: usize,
    create: fn() -> T,
    allocated: AtomicU64,
    reused: AtomicU64,
    dropped: AtomicU64,
}

impl<T: Recycle> ObjectPool<T> {
    pub(crate) fn new(max_idle: usize, create: fn() -> T) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(max_idle.min(64))),
            max_idle,
            create,
            allocated: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub(crate) fn acquire(&self) -> T {
        if let Some(value) = self.idle.lock().pop() {
            self.reused.fetch_add(1, Ordering::Relaxed);
            return value;
        }
        self.allocated.fetch_add(1, Ordering::Relaxed);
        (self.create)()
    }

    pub(crate) fn release(&self, mut value: T) {
        value.recycle();
        let mut idle = self.idle.lock();
        if idle.len() >= self.max_idle {
            drop(idle);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        idle.push(value);
    }

    #[cfg(test)]
    pub(crate) fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ObjectPool, PoolStats, Recycle};

    #[derive(Debug, Default)]
    struct Scratch {
        text: String,
    }

    impl Recycle for Scratch {
        fn recycle(&mut self) {
            self.text.clear();
        }
    }

    fn new_scratch() -> Scratch {
        Scratch {
            text: String::with_capacity(32),
        }
    }

    #[test]
    fn released_objects_are_reset_and_reused() {
        let pool = ObjectPool::new(4, new_scratch);
        let mut first = pool.acquire();
        first.text.push_str("api.example.com");
        let capacity = first.text.capacity();
        pool.release(first);

        let second = pool.acquire();
        assert!(second.text.is_empty());
        assert_eq!(second.text.capacity(), capacity);
        assert_eq!(
            pool.stats(),
            PoolStats {
                allocated: 1,
                reused: 1,
                dropped: 0,
            }
        );
    }

    #[test]
    fn pool_drops_objects_beyond_idle_cap() {
        let pool = ObjectPool::new(2, new_scratch);
        let held: Vec<Scratch> = (0..3).map(|_| pool.acquire()).collect();
        for value in held {
            pool.release(value);
        }
        assert_eq!(pool.idle_len(), 2);
        assert_eq!(pool.stats().allocated, 3);
        assert_eq!(pool.stats().dropped, 1);
    }

    #[test]
    fn boxed_objects_recycle_their_contents() {
        let pool = ObjectPool::new(1, || Box::new(new_scratch()));
        let mut boxed = pool.acquire();
        boxed.text.push_str("leftover");
        pool.release(boxed);
        assert!(pool.acquire().text.is_empty());
    }
}
