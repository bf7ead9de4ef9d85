//! Registered mutator threads.
//!
//! Each registered thread owns a [`ThreadRecord`]: its identity, stack base,
//! run status, the park handshake used to stop it, and its allocation
//! cache. The [`ThreadRegistry`] holds the records and the world-stopped
//! flag; registration and leaving a blocking section wait while the world
//! is stopped.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::cache::AllocCache;
use super::platform::{CapturedContext, SuspendState};
use crate::error::GcError;
use crate::gc::sync::{LockOrder, Ordered};
use crate::stack::{with_spilled_registers, SpilledContext};

/// What a registered thread is doing, as far as the collector knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadStatus {
    /// Executing mutator code; must be stopped before a collection.
    Running = 0,
    /// Inside a blocking section. Its stack above the recorded stack
    /// pointer is frozen and it does not touch the heap.
    Blocked = 1,
    /// Stopped at a safepoint on the collector's request.
    Parked = 2,
    /// Unregistered. The record is kept only until its slot is reused.
    Finished = 3,
}

impl ThreadStatus {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Blocked,
            2 => Self::Parked,
            _ => Self::Finished,
        }
    }
}

#[derive(Debug, Default)]
struct ParkState {
    requested: bool,
    context: Option<SpilledContext>,
}

/// Collector-side state of one registered thread.
pub struct ThreadRecord {
    id: ThreadId,
    stack_base: AtomicUsize,
    status: AtomicU8,
    suspend_requested: AtomicBool,
    park: Mutex<ParkState>,
    park_cv: Condvar,
    cache: Mutex<AllocCache>,
}

impl std::fmt::Debug for ThreadRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRecord")
            .field("id", &self.id)
            .field("stack_base", &format_args!("{:#x}", self.stack_base()))
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl ThreadRecord {
    fn new(id: ThreadId, stack_base: usize, max_small_granules: usize) -> Self {
        Self {
            id,
            stack_base: AtomicUsize::new(stack_base),
            status: AtomicU8::new(ThreadStatus::Running as u8),
            suspend_requested: AtomicBool::new(false),
            park: Mutex::new(ParkState::default()),
            park_cv: Condvar::new(),
            cache: Mutex::new(AllocCache::new(max_small_granules)),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ThreadId {
        self.id
    }

    /// Highest address of the thread's stack.
    #[must_use]
    pub fn stack_base(&self) -> usize {
        self.stack_base.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn status(&self) -> ThreadStatus {
        ThreadStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.status() != ThreadStatus::Finished
    }

    /// The collector wants this thread to stop at its next safepoint.
    #[inline]
    #[must_use]
    pub fn suspend_requested(&self) -> bool {
        self.suspend_requested.load(Ordering::Acquire)
    }

    /// Stack pointer and registers recorded when the thread parked or
    /// entered a blocking section.
    #[must_use]
    pub fn recorded_context(&self) -> Option<CapturedContext> {
        let park = self.lock_park();
        let spilled = park.context?;
        Some(CapturedContext {
            stack_pointer: spilled.stack_pointer,
            stack_base: self.stack_base(),
            registers: spilled.registers.to_vec(),
        })
    }

    fn lock_park(&self) -> Ordered<MutexGuard<'_, ParkState>> {
        Ordered::acquire(LockOrder::ThreadPark, || self.park.lock())
    }

    pub(crate) fn lock_cache(&self) -> Ordered<MutexGuard<'_, AllocCache>> {
        Ordered::acquire(LockOrder::ThreadCache, || self.cache.lock())
    }

    fn set_status(&self, status: ThreadStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Asks the thread to park at its next safepoint.
    pub(crate) fn request_suspend(&self) {
        let mut park = self.lock_park();
        park.requested = true;
        self.suspend_requested.store(true, Ordering::Release);
    }

    /// Waits until the thread parked, is blocked, or has finished.
    pub(crate) fn wait_for_stop(&self) -> SuspendState {
        let mut park = self.lock_park();
        loop {
            match self.status() {
                ThreadStatus::Parked => return SuspendState::Suspended,
                ThreadStatus::Blocked => return SuspendState::Blocked,
                ThreadStatus::Finished => return SuspendState::Exited,
                ThreadStatus::Running => self.park_cv.wait(park.inner_mut()),
            }
        }
    }

    /// Withdraws a suspend request and wakes the thread if it parked.
    pub(crate) fn release(&self) {
        let mut park = self.lock_park();
        park.requested = false;
        self.suspend_requested.store(false, Ordering::Release);
        self.park_cv.notify_all();
    }

    /// Parks the calling thread if a suspend was requested. Must be called
    /// by the thread that owns this record, holding no collector locks.
    /// Returns whether it parked.
    pub(crate) fn park_if_requested(&self) -> bool {
        if !self.suspend_requested() {
            return false;
        }
        with_spilled_registers(|ctx| {
            let mut park = self.lock_park();
            if !park.requested {
                return false;
            }
            park.context = Some(*ctx);
            self.set_status(ThreadStatus::Parked);
            self.park_cv.notify_all();
            while park.requested {
                self.park_cv.wait(park.inner_mut());
            }
            park.context = None;
            self.set_status(ThreadStatus::Running);
            true
        })
    }

    /// Marks the owning thread as blocked with the given context.
    pub(crate) fn enter_blocking(&self, ctx: &SpilledContext) {
        let mut park = self.lock_park();
        park.context = Some(*ctx);
        self.set_status(ThreadStatus::Blocked);
        self.park_cv.notify_all();
    }

    fn finish(&self) {
        let mut park = self.lock_park();
        park.context = None;
        self.set_status(ThreadStatus::Finished);
        self.park_cv.notify_all();
    }
}

struct RegistryState {
    records: Vec<Arc<ThreadRecord>>,
    world_stopped: bool,
}

/// All threads registered with one collector.
pub struct ThreadRegistry {
    state: Mutex<RegistryState>,
    world_cv: Condvar,
    max_small_granules: usize,
}

impl ThreadRegistry {
    #[must_use]
    pub fn new(max_small_granules: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                records: Vec::new(),
                world_stopped: false,
            }),
            world_cv: Condvar::new(),
            max_small_granules,
        }
    }

    fn lock(&self) -> Ordered<MutexGuard<'_, RegistryState>> {
        Ordered::acquire(LockOrder::Registry, || self.state.lock())
    }

    /// Registers the calling thread.
    ///
    /// Waits while the world is stopped. A finished record's slot is reused.
    ///
    /// # Errors
    ///
    /// [`GcError::AlreadyRegistered`] if the calling thread has a live
    /// record.
    pub fn register(&self, stack_base: usize) -> Result<Arc<ThreadRecord>, GcError> {
        let id = std::thread::current().id();
        let mut state = self.lock();
        while state.world_stopped {
            self.world_cv.wait(state.inner_mut());
        }
        if state.records.iter().any(|r| r.id == id && r.is_live()) {
            return Err(GcError::AlreadyRegistered);
        }
        let record = Arc::new(ThreadRecord::new(id, stack_base, self.max_small_granules));
        match state.records.iter().position(|r| !r.is_live()) {
            Some(slot) => state.records[slot] = Arc::clone(&record),
            None => state.records.push(Arc::clone(&record)),
        }
        Ok(record)
    }

    /// Marks `record` finished and drops its cached objects.
    pub fn unregister(&self, record: &ThreadRecord) {
        let _state = self.lock();
        record.finish();
        record.lock_cache().discard();
    }

    /// The live record of thread `id`.
    #[must_use]
    pub fn lookup(&self, id: ThreadId) -> Option<Arc<ThreadRecord>> {
        self.lock()
            .records
            .iter()
            .find(|r| r.id == id && r.is_live())
            .cloned()
    }

    #[must_use]
    pub fn live_threads(&self) -> usize {
        self.lock().records.iter().filter(|r| r.is_live()).count()
    }

    #[must_use]
    pub fn is_world_stopped(&self) -> bool {
        self.lock().world_stopped
    }

    /// Sets the world-stopped flag and snapshots the live records.
    pub(crate) fn begin_stop(&self) -> Vec<Arc<ThreadRecord>> {
        let mut state = self.lock();
        state.world_stopped = true;
        state.records.iter().filter(|r| r.is_live()).cloned().collect()
    }

    /// Clears the world-stopped flag and wakes waiting threads.
    pub(crate) fn end_stop(&self) {
        let mut state = self.lock();
        state.world_stopped = false;
        self.world_cv.notify_all();
    }

    /// Ends a blocking section of `record`'s thread once the world runs.
    pub(crate) fn leave_blocking(&self, record: &ThreadRecord) {
        let mut state = self.lock();
        while state.world_stopped {
            self.world_cv.wait(state.inner_mut());
        }
        let mut park = record.lock_park();
        park.context = None;
        record.set_status(ThreadStatus::Running);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn one_live_record_per_thread() {
        let registry = ThreadRegistry::new(128);
        let record = registry.register(0x1000).unwrap();
        assert!(matches!(registry.register(0x1000), Err(GcError::AlreadyRegistered)));
        assert_eq!(registry.live_threads(), 1);

        registry.unregister(&record);
        assert_eq!(record.status(), ThreadStatus::Finished);
        assert!(registry.lookup(std::thread::current().id()).is_none());

        let again = registry.register(0x2000).unwrap();
        assert_eq!(again.stack_base(), 0x2000);
        assert_eq!(registry.lock().records.len(), 1);
    }

    #[test]
    fn park_handshake() {
        let registry = Arc::new(ThreadRegistry::new(128));
        let (tx, rx) = std::sync::mpsc::channel();
        let worker = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                let record = registry.register(0x1000).unwrap();
                tx.send(Arc::clone(&record)).unwrap();
                while !record.park_if_requested() {
                    std::thread::sleep(Duration::from_millis(1));
                }
                registry.unregister(&record);
            })
        };
        let record = rx.recv().unwrap();

        let snapshot = registry.begin_stop();
        assert_eq!(snapshot.len(), 1);
        record.request_suspend();
        assert_eq!(record.wait_for_stop(), SuspendState::Suspended);
        assert!(record.recorded_context().is_some());
        record.release();
        worker.join().unwrap();
        registry.end_stop();
        assert_eq!(record.wait_for_stop(), SuspendState::Exited);
    }
}
