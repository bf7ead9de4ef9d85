//! # Lock ordering
//!
//! Every lock in the collector has a level. A thread may only acquire a
//! lock whose level is at least the highest level it already holds.
//!
//! | Level | Lock              | Guards                                    |
//! |-------|-------------------|-------------------------------------------|
//! | 1     | `AllocationLock`  | `Heap`: blocks, free lists, roots, phase  |
//! | 2     | `Registry`        | thread records, world-stopped flag        |
//! | 3     | `ThreadPark`      | one thread's park/suspend handshake       |
//! | 3     | `ThreadCache`     | one thread's allocation cache             |
//! | 4     | `MarkLock`        | shared mark stack, helper bookkeeping     |
//! | 5     | `Hooks`           | stop predicate and out-of-memory callback |
//!
//! The collecting thread holds the allocation lock for the whole
//! collection, takes the registry lock to stop and resume the world, and
//! the park and cache locks of each thread while it is stopped. Helper
//! markers only ever hold the mark lock.
//!
//! In debug builds [`LockGuard`] records the levels held by the current
//! thread and panics on a downgrade. [`Ordered`] pairs a real lock guard
//! with a `LockGuard` so both are released together.

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};

/// Lock levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockOrder {
    AllocationLock = 1,
    Registry = 2,
    ThreadPark = 3,
    ThreadCache = 4,
    MarkLock = 5,
    Hooks = 6,
}

impl LockOrder {
    /// Acquisition level. Same-level locks may nest in any order.
    #[must_use]
    pub const fn level(self) -> u8 {
        match self {
            Self::AllocationLock => 1,
            Self::Registry => 2,
            Self::ThreadPark | Self::ThreadCache => 3,
            Self::MarkLock => 4,
            Self::Hooks => 5,
        }
    }
}

thread_local!(static HELD: RefCell<Vec<LockOrder>> = const { RefCell::new(Vec::new()) });

/// Highest lock level held by the current thread, 0 if none.
#[must_use]
pub fn max_held_level() -> u8 {
    HELD.try_with(|held| held.borrow().iter().map(|o| o.level()).max().unwrap_or(0))
        .unwrap_or(0)
}

/// Debug-build validation that `tag` may be acquired now.
///
/// # Panics
///
/// Panics in debug builds on a downgrade.
#[inline]
pub fn validate_lock_order(tag: LockOrder) {
    #[cfg(debug_assertions)]
    {
        let held = max_held_level();
        assert!(
            tag.level() >= held,
            "lock ordering violation: {tag:?} (level {}) acquired while holding level {held}",
            tag.level(),
        );
    }
    let _ = tag;
}

/// Records a lock level as held for its lifetime.
#[must_use = "LockGuard must be held for the duration of the critical section"]
pub struct LockGuard {
    tag: LockOrder,
}

impl LockGuard {
    pub fn new(tag: LockOrder) -> Self {
        validate_lock_order(tag);
        #[cfg(debug_assertions)]
        let _ = HELD.try_with(|held| held.borrow_mut().push(tag));
        Self { tag }
    }

    #[must_use]
    pub const fn tag(&self) -> LockOrder {
        self.tag
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        let _ = HELD.try_with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|&t| t == self.tag) {
                held.remove(pos);
            }
        });
    }
}

/// A lock guard plus its ordering record.
pub struct Ordered<G> {
    // Field order matters: the lock is released before the record is.
    guard: G,
    _order: LockGuard,
}

impl<G> Ordered<G> {
    /// Validates `tag`, then acquires the lock through `acquire`.
    pub fn acquire(tag: LockOrder, acquire: impl FnOnce() -> G) -> Self {
        let order = LockGuard::new(tag);
        Self {
            guard: acquire(),
            _order: order,
        }
    }

    /// Wraps an already acquired guard.
    pub fn wrap(tag: LockOrder, guard: G) -> Self {
        Self {
            guard,
            _order: LockGuard::new(tag),
        }
    }

    /// The inner guard, e.g. for `Condvar::wait`.
    pub fn inner_mut(&mut self) -> &mut G {
        &mut self.guard
    }
}

impl<G: Deref> Deref for Ordered<G> {
    type Target = G::Target;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<G: DerefMut> DerefMut for Ordered<G> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn levels() {
        assert_eq!(LockOrder::AllocationLock.level(), 1);
        assert_eq!(LockOrder::ThreadPark.level(), LockOrder::ThreadCache.level());
        assert!(LockOrder::MarkLock.level() > LockOrder::Registry.level());
    }

    #[test]
    fn nested_increasing_is_allowed_and_released() {
        assert_eq!(max_held_level(), 0);
        {
            let _a = LockGuard::new(LockOrder::AllocationLock);
            let _b = LockGuard::new(LockOrder::Registry);
            let _c = LockGuard::new(LockOrder::ThreadPark);
            let _d = LockGuard::new(LockOrder::ThreadCache);
            #[cfg(debug_assertions)]
            assert_eq!(max_held_level(), 3);
        }
        assert_eq!(max_held_level(), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "lock ordering violation")]
    fn downgrade_panics() {
        let _mark = LockGuard::new(LockOrder::MarkLock);
        let _heap = LockGuard::new(LockOrder::AllocationLock);
    }

    #[test]
    fn ordered_wraps_mutex_guard() {
        let lock = Mutex::new(5);
        {
            let mut guard = Ordered::acquire(LockOrder::AllocationLock, || lock.lock());
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 6);
        assert_eq!(max_held_level(), 0);
    }
}
