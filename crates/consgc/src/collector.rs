//! The public face of one collector instance.
//!
//! A [`Collector`] owns a heap, a thread registry, the stop-the-world
//! controller and the helper marker pool. Threads that allocate register
//! with it and get a [`ThreadHandle`]; everything else (roots, hooks,
//! queries, explicit collections) goes through the `Collector` itself.
//!
//! ```
//! use consgc::{Collector, GcConfig};
//!
//! let gc = Collector::new(GcConfig::default().with_markers(1)).unwrap();
//! let me = gc.register_current_thread().unwrap();
//! let obj = me.alloc(64).unwrap();
//! assert!(gc.is_heap_ptr(obj.as_ptr()));
//! assert_eq!(gc.size(obj.as_ptr()), Some(64));
//! ```

use std::collections::HashSet;
use std::fmt;
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::{Mutex, MutexGuard};

use crate::config::{GcConfig, OomHandler};
use crate::error::{fatal, GcError};
use crate::gc::collect::{AllocCounters, RetryState, Room};
use crate::gc::marker::ParallelMarkCoordinator;
use crate::gc::sync::{LockOrder, Ordered};
use crate::heap::allocator::carve_block;
use crate::heap::{
    BlockGeometry, FreeList, Heap, KindDescriptor, MemorySource, ObjectKind, SystemMemory,
    GRANULE_BYTES,
};
use crate::metrics::{CollectorMetrics, HeapStats};
use crate::stack::with_spilled_registers;
use crate::thread::platform::{CooperativeThreadControl, PlatformThreadControl};
use crate::thread::registry::{ThreadRecord, ThreadRegistry, ThreadStatus};
use crate::thread::world::WorldController;
use crate::thread::ThreadHandle;

/// Polled during marking; returning `true` abandons the collection.
pub type StopPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

pub(crate) type HeapGuard<'a> = Ordered<MutexGuard<'a, Heap>>;

pub(crate) struct Hooks {
    pub(crate) stop: Option<StopPredicate>,
    pub(crate) oom: Option<OomHandler>,
}

/// State shared by a [`Collector`] and its thread handles.
pub(crate) struct Shared {
    pub(crate) config: GcConfig,
    pub(crate) geometry: BlockGeometry,
    heap: Mutex<Heap>,
    pub(crate) registry: ThreadRegistry,
    pub(crate) world: WorldController,
    pub(crate) marker: ParallelMarkCoordinator,
    pub(crate) counters: AllocCounters,
    pub(crate) metrics: CollectorMetrics,
    hooks: Mutex<Hooks>,
    pub(crate) disabled: AtomicUsize,
}

#[inline]
fn object_ptr(addr: usize) -> NonNull<u8> {
    match NonNull::new(addr as *mut u8) {
        Some(ptr) => ptr,
        None => fatal!("allocator produced a null object"),
    }
}

impl Shared {
    pub(crate) fn hooks(&self) -> Ordered<MutexGuard<'_, Hooks>> {
        Ordered::acquire(LockOrder::Hooks, || self.hooks.lock())
    }

    /// Takes the allocation lock. A registered thread that has to wait for
    /// it counts as blocked meanwhile, so a collector holding the lock can
    /// stop the world without it.
    pub(crate) fn lock_heap(&self, me: Option<&ThreadRecord>) -> HeapGuard<'_> {
        if let Some(guard) = self.heap.try_lock() {
            return Ordered::wrap(LockOrder::AllocationLock, guard);
        }
        let Some(record) = me else {
            return Ordered::acquire(LockOrder::AllocationLock, || self.heap.lock());
        };
        if record.status() == ThreadStatus::Blocked {
            // Inside do_blocking: already counted as stopped, and leaving
            // here would end the section early.
            return Ordered::acquire(LockOrder::AllocationLock, || self.heap.lock());
        }
        self.world.platform().safepoint(record);
        with_spilled_registers(|ctx| {
            record.enter_blocking(ctx);
            let guard = Ordered::acquire(LockOrder::AllocationLock, || self.heap.lock());
            self.registry.leave_blocking(record);
            guard
        })
    }

    fn current_record(&self) -> Option<Arc<ThreadRecord>> {
        self.registry.lookup(std::thread::current().id())
    }

    /// Allocates `bytes` of `kind` for the registered thread `me`.
    pub(crate) fn allocate(
        &self,
        me: &ThreadRecord,
        bytes: usize,
        kind: ObjectKind,
    ) -> Result<NonNull<u8>, GcError> {
        self.world.platform().safepoint(me);
        let granules = self.geometry.granules_for(bytes);
        if granules > self.geometry.max_small_granules {
            return self.allocate_large(me, bytes, kind);
        }
        if !kind.is_cached() {
            return self.allocate_small_locked(me, bytes, granules, kind);
        }
        let hit = me.lock_cache().pop(kind, granules);
        match hit {
            Some(addr) => {
                self.counters
                    .record_alloc(granules * GRANULE_BYTES, kind == ObjectKind::NORMAL);
                Ok(object_ptr(addr))
            }
            None => self.refill(me, bytes, granules, kind),
        }
    }

    /// Cache miss: take a batch from the global list, or carve a fresh
    /// block outside the allocation lock, or make room.
    fn refill(
        &self,
        me: &ThreadRecord,
        bytes: usize,
        granules: usize,
        kind: ObjectKind,
    ) -> Result<NonNull<u8>, GcError> {
        let scanned = kind == ObjectKind::NORMAL;
        let mut retry = RetryState::default();
        let mut heap = self.lock_heap(Some(me));
        loop {
            let h = &mut *heap;
            let batch =
                h.allocator
                    .take_batch(kind, granules, self.geometry.objects_per_block(granules));
            if !batch.is_empty() {
                drop(heap);
                return Ok(self.install_and_pop(me, kind, granules, batch, scanned));
            }

            let fresh = h
                .allocator
                .new_small_block(&mut h.space, kind, granules, retry.allow_black_listed)?;
            if let Some(fresh) = fresh {
                if fresh.black_listed {
                    self.note_black_listed(fresh.start, 1);
                }
                self.marker.begin_free_list_build();
                drop(heap);
                // SAFETY: the block was just registered for this size class
                // and none of its objects has been handed out. A collection
                // waits for this build before it stops the world.
                let list = unsafe {
                    carve_block(fresh.start, granules, &self.geometry, fresh.needs_zeroing)
                };
                let ptr = self.install_and_pop(me, kind, granules, list, scanned);
                self.marker.end_free_list_build();
                return Ok(ptr);
            }

            if self.make_room(h, Some(me), &mut retry, bytes) == Room::Exhausted {
                drop(heap);
                return self.out_of_memory(bytes);
            }
        }
    }

    fn install_and_pop(
        &self,
        me: &ThreadRecord,
        kind: ObjectKind,
        granules: usize,
        list: FreeList,
        scanned: bool,
    ) -> NonNull<u8> {
        let addr = {
            let mut cache = me.lock_cache();
            cache.install(kind, granules, list);
            cache.pop(kind, granules)
        };
        match addr {
            Some(addr) => {
                self.counters.record_alloc(granules * GRANULE_BYTES, scanned);
                object_ptr(addr)
            }
            None => fatal!("refilled cache for {granules} granules is empty"),
        }
    }

    /// Small objects of kinds without a thread cache come straight from the
    /// global lists.
    fn allocate_small_locked(
        &self,
        me: &ThreadRecord,
        bytes: usize,
        granules: usize,
        kind: ObjectKind,
    ) -> Result<NonNull<u8>, GcError> {
        let mut retry = RetryState::default();
        let mut heap = self.lock_heap(Some(me));
        loop {
            let h = &mut *heap;
            let scanned = h.allocator.kinds.get(kind).scan;
            let allocation =
                h.allocator
                    .alloc_small(&mut h.space, kind, granules, retry.allow_black_listed)?;
            if let Some(allocation) = allocation {
                drop(heap);
                if allocation.black_listed {
                    self.note_black_listed(allocation.addr, 1);
                }
                self.counters.record_alloc(allocation.bytes, scanned);
                return Ok(object_ptr(allocation.addr));
            }
            if self.make_room(h, Some(me), &mut retry, bytes) == Room::Exhausted {
                drop(heap);
                return self.out_of_memory(bytes);
            }
        }
    }

    fn allocate_large(
        &self,
        me: &ThreadRecord,
        bytes: usize,
        kind: ObjectKind,
    ) -> Result<NonNull<u8>, GcError> {
        let limit = self
            .config
            .max_heap_size
            .map_or(self.geometry.max_object_bytes(), |cap| {
                cap.min(self.geometry.max_object_bytes())
            });
        if bytes > limit {
            return self.out_of_memory(bytes);
        }
        let mut retry = RetryState::default();
        let mut heap = self.lock_heap(Some(me));
        loop {
            let h = &mut *heap;
            let scanned = h.allocator.kinds.get(kind).scan;
            let allocation =
                h.allocator
                    .alloc_large(&mut h.space, kind, bytes, retry.allow_black_listed)?;
            if let Some(allocation) = allocation {
                drop(heap);
                if allocation.black_listed {
                    let blocks = allocation.bytes / self.geometry.block_size;
                    self.note_black_listed(allocation.addr, blocks);
                }
                self.counters.record_alloc(allocation.bytes, scanned);
                return Ok(object_ptr(allocation.addr));
            }
            if self.make_room(h, Some(me), &mut retry, bytes) == Room::Exhausted {
                drop(heap);
                return self.out_of_memory(bytes);
            }
        }
    }

    /// Last resort. Called without the allocation lock so the handler may
    /// use the collector.
    fn out_of_memory(&self, bytes: usize) -> Result<NonNull<u8>, GcError> {
        let handler = self.hooks().oom.clone();
        handler
            .and_then(|handler| handler(bytes))
            .ok_or(GcError::OutOfMemory { requested: bytes })
    }

    /// Explicitly frees the object at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be the start of an object of this collector that nothing
    /// uses any more.
    pub(crate) unsafe fn free(&self, me: Option<&ThreadRecord>, ptr: NonNull<u8>) {
        let mut heap = self.lock_heap(me);
        let h = &mut *heap;
        let released = h.allocator.release(&mut h.space, ptr.as_ptr() as usize);
        drop(heap);
        self.counters.record_free(released.bytes, released.scanned);
    }

    pub(crate) fn collect_as(&self, me: Option<&ThreadRecord>, trigger: &'static str) -> bool {
        let mut heap = self.lock_heap(me);
        self.collect_locked(&mut heap, me, trigger)
    }
}

/// A problem found by [`Collector::check_heap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeapCheckError {
    /// An object appears twice on the free lists.
    Duplicate {
        /// The repeated object.
        addr: usize,
    },
    /// A free-list entry is not the start of an object in an in-use block
    /// of the list's kind and size.
    Misplaced {
        /// The offending entry.
        addr: usize,
        /// Kind of the list it was found on.
        kind: ObjectKind,
        /// Size class of that list, in granules.
        granules: usize,
    },
    /// A list ended before its recorded length.
    Truncated {
        /// Recorded length.
        expected: usize,
        /// Entries actually reachable.
        found: usize,
    },
}

impl fmt::Display for HeapCheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplicate { addr } => write!(f, "object {addr:#x} is on the free lists twice"),
            Self::Misplaced { addr, kind, granules } => write!(
                f,
                "free-list entry {addr:#x} is not a {granules}-granule object of kind {}",
                kind.index()
            ),
            Self::Truncated { expected, found } => {
                write!(f, "free list holds {found} entries, expected {expected}")
            }
        }
    }
}

impl std::error::Error for HeapCheckError {}

fn check_list(
    heap: &Heap,
    kind: ObjectKind,
    granules: usize,
    list: &FreeList,
    seen: &mut HashSet<usize>,
) -> Result<(), HeapCheckError> {
    let mut found = 0;
    // SAFETY: the allocation lock is held and the list belongs either to
    // the heap or to the calling thread's cache.
    for addr in unsafe { list.iter() } {
        found += 1;
        let in_place = heap.space.header_for(addr).is_some_and(|(_, header)| {
            header.kind == kind
                && header.granules == granules
                && header.locate(addr, false).is_some_and(|o| o.start == addr)
        });
        if !in_place {
            return Err(HeapCheckError::Misplaced { addr, kind, granules });
        }
        if !seen.insert(addr) {
            return Err(HeapCheckError::Duplicate { addr });
        }
    }
    if found == list.len() {
        Ok(())
    } else {
        Err(HeapCheckError::Truncated {
            expected: list.len(),
            found,
        })
    }
}

/// A conservative mark-sweep collector.
///
/// Cloning is cheap and yields another handle to the same collector.
#[derive(Clone)]
pub struct Collector {
    shared: Arc<Shared>,
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("config", &self.shared.config)
            .field("threads", &self.shared.registry.live_threads())
            .field("collections", &self.shared.metrics.total_collections())
            .finish_non_exhaustive()
    }
}

impl Collector {
    /// Creates a collector with cooperative thread suspension and
    /// OS-mapped memory.
    ///
    /// # Errors
    ///
    /// [`GcError::InvalidConfig`] if `config` does not validate,
    /// [`GcError::Map`] if the initial heap cannot be mapped and
    /// [`GcError::Spawn`] if a helper marker cannot be started.
    pub fn new(config: GcConfig) -> Result<Self, GcError> {
        Self::with_platform(config, Arc::new(CooperativeThreadControl), Arc::new(SystemMemory))
    }

    /// Creates a collector with a custom thread-control strategy and memory
    /// source.
    ///
    /// # Errors
    ///
    /// As for [`Collector::new`].
    pub fn with_platform(
        config: GcConfig,
        platform: Arc<dyn PlatformThreadControl>,
        memory: Arc<dyn MemorySource>,
    ) -> Result<Self, GcError> {
        config.validate()?;
        let geometry = BlockGeometry::new(config.block_size, config.extra_byte);
        let heap = Heap::new(&config, memory)?;
        let marker = ParallelMarkCoordinator::new(config.markers - 1).map_err(GcError::Spawn)?;
        let hooks = Hooks {
            stop: None,
            oom: config.oom_handler.clone(),
        };
        Ok(Self {
            shared: Arc::new(Shared {
                geometry,
                heap: Mutex::new(heap),
                registry: ThreadRegistry::new(geometry.max_small_granules),
                world: WorldController::new(platform),
                marker,
                counters: AllocCounters::new(),
                metrics: CollectorMetrics::new(),
                hooks: Mutex::new(hooks),
                disabled: AtomicUsize::new(0),
                config,
            }),
        })
    }

    pub(crate) const fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Collector with [`GcConfig::from_env`].
    ///
    /// # Errors
    ///
    /// As for [`GcConfig::from_env`] and [`Collector::new`].
    pub fn from_env() -> Result<Self, GcError> {
        Self::new(GcConfig::from_env()?)
    }

    #[must_use]
    pub fn config(&self) -> &GcConfig {
        &self.shared.config
    }

    // ------------------------------------------------------------------
    // Threads
    // ------------------------------------------------------------------

    /// Registers the calling thread, using the platform to find its stack
    /// base.
    ///
    /// # Errors
    ///
    /// [`GcError::UnknownStackBase`] if the platform cannot tell, and
    /// [`GcError::AlreadyRegistered`] if the thread holds a live handle.
    pub fn register_current_thread(&self) -> Result<ThreadHandle, GcError> {
        let base = self
            .shared
            .world
            .platform()
            .current_stack_base()
            .ok_or(GcError::UnknownStackBase)?;
        let record = self.shared.registry.register(base)?;
        Ok(ThreadHandle::new(Arc::clone(&self.shared), record))
    }

    /// Registers the calling thread with an explicit stack base.
    ///
    /// # Safety
    ///
    /// `stack_base` must be at or above every frame of the calling thread
    /// that may hold heap pointers, and the memory between it and the stack
    /// pointer must stay readable while the thread is registered.
    ///
    /// # Errors
    ///
    /// [`GcError::AlreadyRegistered`] if the thread holds a live handle.
    pub unsafe fn register_thread_with_stack_base(
        &self,
        stack_base: usize,
    ) -> Result<ThreadHandle, GcError> {
        let record = self.shared.registry.register(stack_base)?;
        Ok(ThreadHandle::new(Arc::clone(&self.shared), record))
    }

    /// The live record of thread `id`, if it is registered.
    #[must_use]
    pub fn lookup_thread(&self, id: ThreadId) -> Option<Arc<ThreadRecord>> {
        self.shared.registry.lookup(id)
    }

    /// Registered threads that have not unregistered.
    #[must_use]
    pub fn live_threads(&self) -> usize {
        self.shared.registry.live_threads()
    }

    // ------------------------------------------------------------------
    // Collection control
    // ------------------------------------------------------------------

    /// Runs a full collection now. Returns `false` if collection is
    /// disabled or the stop predicate aborted it.
    pub fn collect(&self) -> bool {
        let me = self.shared.current_record();
        self.shared.collect_as(me.as_deref(), "explicit")
    }

    /// Suppresses collections until a matching [`enable`](Self::enable).
    /// Calls nest.
    pub fn disable(&self) {
        self.shared.disabled.fetch_add(1, Ordering::AcqRel);
    }

    /// Undoes one [`disable`](Self::disable). Extra calls are ignored.
    pub fn enable(&self) {
        let _ = self
            .shared
            .disabled
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Installs a predicate polled during marking. Once it returns `true`
    /// the running collection is abandoned without sweeping.
    pub fn set_stop_predicate(&self, stop: impl Fn() -> bool + Send + Sync + 'static) {
        self.shared.hooks().stop = Some(Arc::new(stop));
    }

    pub fn clear_stop_predicate(&self) {
        self.shared.hooks().stop = None;
    }

    /// Replaces the out-of-memory callback.
    pub fn set_oom_handler(&self, handler: Option<OomHandler>) {
        self.shared.hooks().oom = handler;
    }

    // ------------------------------------------------------------------
    // Roots
    // ------------------------------------------------------------------

    /// Adds `range` to the roots scanned by every collection.
    ///
    /// # Safety
    ///
    /// The whole range must stay readable until it is removed.
    pub unsafe fn add_roots(&self, range: Range<usize>) {
        let me = self.shared.current_record();
        self.shared.lock_heap(me.as_deref()).roots.add(range);
    }

    /// Removes registered root ranges lying entirely within `range`.
    pub fn remove_roots(&self, range: Range<usize>) {
        let me = self.shared.current_record();
        self.shared.lock_heap(me.as_deref()).roots.remove(range);
    }

    // ------------------------------------------------------------------
    // Heap and kinds
    // ------------------------------------------------------------------

    /// Registers an object kind. Objects of new kinds are served from the
    /// global free lists, not thread caches.
    ///
    /// # Errors
    ///
    /// [`GcError::TooManyKinds`] once the table is full.
    pub fn new_kind(&self, scan: bool, clear: bool) -> Result<ObjectKind, GcError> {
        let me = self.shared.current_record();
        let mut heap = self.shared.lock_heap(me.as_deref());
        heap.allocator.add_kind(KindDescriptor {
            scan,
            clear,
            uncollectable: false,
        })
    }

    /// Grows the heap by at least `bytes`. Returns the bytes added.
    ///
    /// # Errors
    ///
    /// [`GcError::OutOfMemory`] past the heap cap, [`GcError::Map`] if the
    /// memory source fails.
    pub fn expand_heap(&self, bytes: usize) -> Result<usize, GcError> {
        let me = self.shared.current_record();
        let mut heap = self.shared.lock_heap(me.as_deref());
        heap.space.expand(bytes)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    fn with_heap<R>(&self, f: impl FnOnce(&Heap) -> R) -> R {
        let me = self.shared.current_record();
        let heap = self.shared.lock_heap(me.as_deref());
        f(&heap)
    }

    /// Whether `ptr` points into an allocated heap block.
    #[must_use]
    pub fn is_heap_ptr(&self, ptr: *const u8) -> bool {
        self.with_heap(|heap| heap.space.header_for(ptr as usize).is_some())
    }

    /// Start of the object containing `ptr`, interior pointers included.
    #[must_use]
    pub fn base(&self, ptr: *const u8) -> Option<NonNull<u8>> {
        let addr = ptr as usize;
        self.with_heap(|heap| {
            let (_, header) = heap.space.header_for(addr)?;
            let object = header.locate(addr, true)?;
            NonNull::new(object.start as *mut u8)
        })
    }

    /// Bytes reserved for the object containing `ptr`.
    #[must_use]
    pub fn size(&self, ptr: *const u8) -> Option<usize> {
        let addr = ptr as usize;
        self.with_heap(|heap| {
            let (_, header) = heap.space.header_for(addr)?;
            header.locate(addr, true).map(|_| header.object_bytes)
        })
    }

    /// Whether the object containing `ptr` was marked by the last
    /// collection.
    #[must_use]
    pub fn is_marked(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        self.with_heap(|heap| {
            heap.space.header_for(addr).is_some_and(|(_, header)| {
                header
                    .locate(addr, true)
                    .is_some_and(|o| header.marks.is_marked(o.index))
            })
        })
    }

    /// Whether the block containing `addr` is black-listed.
    #[must_use]
    pub fn is_black_listed(&self, addr: usize) -> bool {
        self.with_heap(|heap| heap.space.black_list.is_black_listed(addr))
    }

    /// Forgets every black-listed block.
    pub fn clear_black_list(&self) {
        let me = self.shared.current_record();
        self.shared.lock_heap(me.as_deref()).space.black_list.clear();
    }

    /// Walks the global free lists and the calling thread's cache looking
    /// for duplicates, cycles and misplaced entries. Returns the number of
    /// free objects seen.
    ///
    /// # Errors
    ///
    /// The first inconsistency found.
    pub fn check_heap(&self) -> Result<usize, HeapCheckError> {
        let me = self.shared.current_record();
        let heap = self.shared.lock_heap(me.as_deref());
        let mut seen = HashSet::new();
        for (kind, granules, list) in heap.allocator.lists() {
            check_list(&heap, kind, granules, list, &mut seen)?;
        }
        if let Some(me) = &me {
            let cache = me.lock_cache();
            for (kind, granules, list) in cache.lists() {
                check_list(&heap, kind, granules, list, &mut seen)?;
            }
        }
        Ok(seen.len())
    }

    /// Current heap occupancy.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let counters = self.shared.counters.snapshot();
        self.with_heap(|heap| {
            let arena = &heap.space.arena;
            let pointer_free_allocated =
                counters.bytes_allocated.saturating_sub(counters.scanned_allocated);
            let pointer_free_freed = counters.bytes_freed.saturating_sub(counters.scanned_freed);
            HeapStats {
                heap_size: arena.heap_size(),
                free_bytes: arena.free_bytes(),
                unmapped_bytes: arena.unmapped_bytes(),
                bytes_in_use: counters
                    .apply(heap.live.pointer_bytes + heap.live.pointer_free_bytes),
                pointer_bytes: (heap.live.pointer_bytes + counters.scanned_allocated)
                    .saturating_sub(counters.scanned_freed),
                pointer_free_bytes: (heap.live.pointer_free_bytes + pointer_free_allocated)
                    .saturating_sub(pointer_free_freed),
                bytes_since_gc: counters.bytes_allocated,
                gc_count: heap.gc_no,
            }
        })
    }

    /// Completed collections.
    #[must_use]
    pub fn gc_count(&self) -> u64 {
        self.with_heap(|heap| heap.gc_no)
    }

    #[must_use]
    pub fn metrics(&self) -> &CollectorMetrics {
        &self.shared.metrics
    }

    /// Helper marker threads, not counting the collecting thread.
    #[must_use]
    pub fn helper_markers(&self) -> usize {
        self.shared.marker.helpers()
    }
}
