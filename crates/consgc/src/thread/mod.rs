//! Mutator threads: registration, allocation caches and the
//! stop-the-world protocol.

pub mod cache;
pub mod platform;
pub mod registry;
pub mod world;

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::collector::{Collector, Shared};
use crate::error::GcError;
use crate::heap::ObjectKind;
use crate::stack::with_spilled_registers;

pub use platform::{CapturedContext, CooperativeThreadControl, PlatformThreadControl, SuspendState};
pub use registry::{ThreadRecord, ThreadRegistry, ThreadStatus};

/// A thread's registration with a [`Collector`].
///
/// All allocation goes through a handle. It stays on the thread that
/// created it and unregisters the thread when dropped.
///
/// A registered thread that waits on something other than the collector
/// (joining another thread, a channel, a lock held by a thread that
/// allocates) must do so inside [`do_blocking`](Self::do_blocking), or a
/// collection started meanwhile waits for it forever.
pub struct ThreadHandle {
    shared: Arc<Shared>,
    record: Arc<ThreadRecord>,
    in_blocking: Cell<bool>,
    _not_send: PhantomData<*const ()>,
}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("record", &self.record)
            .field("in_blocking", &self.in_blocking.get())
            .finish_non_exhaustive()
    }
}

/// Leaves a blocking section even if the closure panics.
struct BlockingSection<'a> {
    handle: &'a ThreadHandle,
}

impl Drop for BlockingSection<'_> {
    fn drop(&mut self) {
        self.handle
            .shared
            .registry
            .leave_blocking(&self.handle.record);
        self.handle.in_blocking.set(false);
    }
}

impl ThreadHandle {
    pub(crate) const fn new(shared: Arc<Shared>, record: Arc<ThreadRecord>) -> Self {
        Self {
            shared,
            record,
            in_blocking: Cell::new(false),
            _not_send: PhantomData,
        }
    }

    #[must_use]
    pub fn record(&self) -> &Arc<ThreadRecord> {
        &self.record
    }

    /// Another handle to the collector this thread is registered with.
    #[must_use]
    pub fn collector(&self) -> Collector {
        Collector::from_shared(Arc::clone(&self.shared))
    }

    /// Allocates `bytes` of a scanned, zero-filled object.
    ///
    /// # Errors
    ///
    /// [`GcError::OutOfMemory`] once collecting, growing the heap and the
    /// out-of-memory callback all failed.
    ///
    /// # Panics
    ///
    /// Inside [`do_blocking`](Self::do_blocking).
    #[inline]
    pub fn alloc(&self, bytes: usize) -> Result<NonNull<u8>, GcError> {
        self.alloc_kind(bytes, ObjectKind::NORMAL)
    }

    /// Allocates `bytes` the collector never scans. Contents are not
    /// cleared.
    ///
    /// # Errors
    ///
    /// As for [`alloc`](Self::alloc).
    #[inline]
    pub fn alloc_atomic(&self, bytes: usize) -> Result<NonNull<u8>, GcError> {
        self.alloc_kind(bytes, ObjectKind::ATOMIC)
    }

    /// Allocates a scanned object that is never reclaimed until freed
    /// explicitly. It keeps everything it points to alive.
    ///
    /// # Errors
    ///
    /// As for [`alloc`](Self::alloc).
    #[inline]
    pub fn alloc_uncollectable(&self, bytes: usize) -> Result<NonNull<u8>, GcError> {
        self.alloc_kind(bytes, ObjectKind::UNCOLLECTABLE)
    }

    /// Allocates `bytes` of `kind`.
    ///
    /// # Errors
    ///
    /// As for [`alloc`](Self::alloc).
    ///
    /// # Panics
    ///
    /// Inside [`do_blocking`](Self::do_blocking).
    pub fn alloc_kind(&self, bytes: usize, kind: ObjectKind) -> Result<NonNull<u8>, GcError> {
        assert!(
            !self.in_blocking.get(),
            "allocation inside do_blocking; the collector may be scanning this thread"
        );
        self.shared.allocate(&self.record, bytes, kind)
    }

    /// Returns an object to its free list right away.
    ///
    /// # Safety
    ///
    /// `ptr` must be the start of a live object of this collector, and no
    /// reference to it may be used afterwards. Invalid and double frees are
    /// detected only in part and abort the process.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        debug_assert!(
            !self.in_blocking.get(),
            "free inside do_blocking; the collector may be scanning this thread"
        );
        // SAFETY: forwarded from the caller.
        unsafe { self.shared.free(Some(&self.record), ptr) };
    }

    /// Runs a full collection from this thread. See
    /// [`Collector::collect`].
    pub fn collect(&self) -> bool {
        self.shared.collect_as(Some(&self.record), "explicit")
    }

    /// Parks here if a collection is waiting for this thread.
    #[inline]
    pub fn safepoint(&self) {
        self.shared.world.platform().safepoint(&self.record);
    }

    /// Runs `f` with this thread counted as stopped. Collections may run
    /// meanwhile and scan the stack as it was on entry; `f` must not
    /// allocate or store heap pointers where the collector would miss them.
    /// Returning waits for a stopped world to resume.
    pub fn do_blocking<R>(&self, f: impl FnOnce() -> R) -> R {
        if self.in_blocking.get() {
            return f();
        }
        self.safepoint();
        with_spilled_registers(|ctx| {
            self.record.enter_blocking(ctx);
            self.in_blocking.set(true);
            let _section = BlockingSection { handle: self };
            f()
        })
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        self.shared.registry.unregister(&self.record);
    }
}

#[cfg(test)]
mod tests {
    use super::ThreadStatus;
    use crate::{Collector, GcConfig, GcError};

    #[test]
    fn second_registration_is_refused_until_drop() {
        let gc = Collector::new(GcConfig::default().with_markers(1)).unwrap();
        let first = gc.register_current_thread().unwrap();
        assert!(matches!(
            gc.register_current_thread(),
            Err(GcError::AlreadyRegistered)
        ));
        assert_eq!(gc.live_threads(), 1);
        drop(first);
        assert_eq!(gc.live_threads(), 0);
        let again = gc.register_current_thread().unwrap();
        assert!(gc.lookup_thread(std::thread::current().id()).is_some());
        drop(again);
    }

    #[test]
    #[should_panic(expected = "allocation inside do_blocking")]
    fn allocating_while_blocked_panics() {
        let gc = Collector::new(GcConfig::default().with_markers(1)).unwrap();
        let me = gc.register_current_thread().unwrap();
        me.do_blocking(|| me.alloc(16).map(|_| ()))
            .unwrap();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "free inside do_blocking")]
    fn freeing_while_blocked_panics() {
        let gc = Collector::new(GcConfig::default().with_markers(1)).unwrap();
        let me = gc.register_current_thread().unwrap();
        let obj = me.alloc(16).unwrap();
        me.do_blocking(|| unsafe { me.free(obj) });
    }

    #[test]
    fn queries_inside_do_blocking_keep_thread_blocked() {
        let gc = Collector::new(GcConfig::default().with_markers(1)).unwrap();
        let me = gc.register_current_thread().unwrap();
        let obj = me.alloc(16).unwrap();
        me.do_blocking(|| {
            assert!(gc.is_heap_ptr(obj.as_ptr()));
            let _ = gc.stats();
            assert_eq!(me.record().status(), ThreadStatus::Blocked);
        });
        assert_eq!(me.record().status(), ThreadStatus::Running);
    }

    #[test]
    fn blocked_thread_does_not_hold_up_collection() {
        let gc = Collector::new(GcConfig::default().with_markers(1)).unwrap();
        let me = gc.register_current_thread().unwrap();
        let worker = {
            let gc = gc.clone();
            std::thread::spawn(move || {
                let handle = gc.register_current_thread().unwrap();
                handle.alloc(64).unwrap();
                assert!(handle.collect());
            })
        };
        me.do_blocking(|| worker.join().unwrap());
        assert_eq!(gc.gc_count(), 1);
    }
}
