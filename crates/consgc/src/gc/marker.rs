//! Parallel marking with persistent helper threads.
//!
//! The coordinator owns `markers - 1` helpers. For each collection the
//! controller publishes the seeded entries and a pointer to the shared
//! [`MarkContext`], then marks alongside the helpers. Every marker takes a
//! batch from the shared stack, drains it locally, and gives half of its
//! local stack back whenever another marker is waiting. Marking ends when
//! the shared stack is empty and no marker holds local work.
//!
//! The same mark lock also counts free-list builders: threads carving a
//! fresh block outside the allocation lock. A collection waits for them to
//! drain before it stops the world.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex, MutexGuard};

use super::engine::{MarkContext, POLL_INTERVAL};
use super::mark::{MarkEntry, MarkStack};
use super::sync::{LockOrder, Ordered};
use crate::tracing::log_marker;

/// Entries taken from the shared stack at once.
const BATCH: usize = 32;

const STOP_POLL: Duration = Duration::from_millis(1);

/// Lifecycle of one helper marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HelperState {
    WaitingForWork = 0,
    Marking = 1,
    Terminated = 2,
}

impl HelperState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::WaitingForWork,
            1 => Self::Marking,
            _ => Self::Terminated,
        }
    }
}

/// Erased pointer to the controller's `MarkContext`.
#[derive(Clone, Copy)]
struct ContextPtr(*const ());

// SAFETY: the pointee is `Sync` and outlives every use: the controller does
// not return from `mark` until all participants have left the cycle.
unsafe impl Send for ContextPtr {}

impl ContextPtr {
    fn new(ctx: &MarkContext<'_>) -> Self {
        Self(std::ptr::from_ref(ctx).cast())
    }

    /// # Safety
    ///
    /// Only valid while the cycle that published it is running.
    unsafe fn get<'a>(self) -> &'a MarkContext<'a> {
        // SAFETY: forwarded from the caller.
        unsafe { &*self.0.cast::<MarkContext<'a>>() }
    }
}

struct MarkQueue {
    entries: Vec<MarkEntry>,
    ctx: Option<ContextPtr>,
    cycle: u64,
    /// Markers currently holding local work.
    busy: usize,
    /// Helpers inside the current cycle.
    participants: usize,
    finished: bool,
    aborted: bool,
    shutdown: bool,
    builders: usize,
}

struct MarkShared {
    queue: Mutex<MarkQueue>,
    work_cv: Condvar,
    done_cv: Condvar,
    builder_cv: Condvar,
    /// Markers blocked on `work_cv` waiting for entries.
    waiting: AtomicUsize,
    aborted: AtomicBool,
    helper_states: Vec<CachePadded<AtomicU8>>,
}

impl MarkShared {
    fn lock(&self) -> Ordered<MutexGuard<'_, MarkQueue>> {
        Ordered::acquire(LockOrder::MarkLock, || self.queue.lock())
    }

    fn set_state(&self, helper: usize, state: HelperState) {
        self.helper_states[helper].store(state as u8, Ordering::Release);
    }
}

/// Helper marker pool plus the free-list builder count.
pub struct ParallelMarkCoordinator {
    shared: Arc<MarkShared>,
    helpers: Vec<JoinHandle<()>>,
}

impl ParallelMarkCoordinator {
    /// Starts `helpers` helper threads. Zero is valid and leaves marking to
    /// the caller.
    ///
    /// # Errors
    ///
    /// Fails if a helper thread cannot be spawned.
    pub fn new(helpers: usize) -> std::io::Result<Self> {
        let shared = Arc::new(MarkShared {
            queue: Mutex::new(MarkQueue {
                entries: Vec::new(),
                ctx: None,
                cycle: 0,
                busy: 0,
                participants: 0,
                finished: true,
                aborted: false,
                shutdown: false,
                builders: 0,
            }),
            work_cv: Condvar::new(),
            done_cv: Condvar::new(),
            builder_cv: Condvar::new(),
            waiting: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
            helper_states: (0..helpers)
                .map(|_| CachePadded::new(AtomicU8::new(HelperState::WaitingForWork as u8)))
                .collect(),
        });
        let mut coordinator = Self {
            shared,
            helpers: Vec::with_capacity(helpers),
        };
        for index in 0..helpers {
            let shared = Arc::clone(&coordinator.shared);
            let handle = std::thread::Builder::new()
                .name(format!("consgc-marker-{index}"))
                .spawn(move || helper_main(&shared, index))?;
            coordinator.helpers.push(handle);
        }
        Ok(coordinator)
    }

    /// Helper threads, not counting the controller.
    #[must_use]
    pub fn helpers(&self) -> usize {
        self.helpers.len()
    }

    #[must_use]
    pub fn helper_state(&self, index: usize) -> HelperState {
        HelperState::from_u8(self.shared.helper_states[index].load(Ordering::Acquire))
    }

    /// Marks from `roots` with every helper. `stop` is polled by the
    /// controller; if it returns `true` all markers abandon the cycle and
    /// this returns `false`.
    pub fn mark(
        &self,
        ctx: &MarkContext<'_>,
        roots: Vec<MarkEntry>,
        stop: &mut dyn FnMut() -> bool,
    ) -> bool {
        if stop() {
            return false;
        }
        {
            let mut queue = self.shared.lock();
            queue.entries = roots;
            queue.ctx = Some(ContextPtr::new(ctx));
            queue.cycle += 1;
            queue.busy = 0;
            queue.finished = false;
            queue.aborted = false;
            self.shared.aborted.store(false, Ordering::Release);
            self.shared.work_cv.notify_all();
        }

        let completed = run_marker(&self.shared, ctx, Some(stop));

        let mut queue = self.shared.lock();
        while queue.participants > 0 {
            self.shared.done_cv.wait(queue.inner_mut());
        }
        queue.ctx = None;
        queue.entries.clear();
        completed
    }

    /// A thread starts carving a block outside the allocation lock. Call
    /// with the allocation lock held.
    pub fn begin_free_list_build(&self) {
        self.shared.lock().builders += 1;
    }

    pub fn end_free_list_build(&self) {
        let mut queue = self.shared.lock();
        queue.builders -= 1;
        if queue.builders == 0 {
            self.shared.builder_cv.notify_all();
        }
    }

    /// Waits until no free-list build is in flight.
    pub fn wait_for_builders(&self) {
        let mut queue = self.shared.lock();
        while queue.builders > 0 {
            self.shared.builder_cv.wait(queue.inner_mut());
        }
    }
}

impl Drop for ParallelMarkCoordinator {
    fn drop(&mut self) {
        {
            let mut queue = self.shared.lock();
            queue.shutdown = true;
            self.shared.work_cv.notify_all();
        }
        for handle in self.helpers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn helper_main(shared: &MarkShared, index: usize) {
    log_marker(index, "started");
    let mut seen_cycle = 0;
    loop {
        let ctx = {
            let mut queue = shared.lock();
            loop {
                if queue.shutdown {
                    shared.set_state(index, HelperState::Terminated);
                    log_marker(index, "terminated");
                    return;
                }
                if queue.cycle != seen_cycle && !queue.finished {
                    if let Some(ctx) = queue.ctx {
                        seen_cycle = queue.cycle;
                        queue.participants += 1;
                        break ctx;
                    }
                }
                shared.work_cv.wait(queue.inner_mut());
            }
        };

        shared.set_state(index, HelperState::Marking);
        // SAFETY: the controller keeps the context alive until
        // `participants` drops back to zero.
        run_marker(shared, unsafe { ctx.get() }, None);
        shared.set_state(index, HelperState::WaitingForWork);

        let mut queue = shared.lock();
        queue.participants -= 1;
        if queue.participants == 0 {
            shared.done_cv.notify_all();
        }
    }
}

/// One marker's share of a cycle. Returns `false` if the cycle was aborted.
fn run_marker(
    shared: &MarkShared,
    ctx: &MarkContext<'_>,
    mut stop: Option<&mut dyn FnMut() -> bool>,
) -> bool {
    let mut local = MarkStack::new();
    let mut queue = shared.lock();
    loop {
        if queue.aborted {
            return false;
        }
        if queue.finished {
            return true;
        }
        if stop.as_mut().is_some_and(|stop| stop()) {
            shared.aborted.store(true, Ordering::Release);
            queue.aborted = true;
            queue.finished = true;
            shared.work_cv.notify_all();
            return false;
        }
        if !queue.entries.is_empty() {
            let take = queue.entries.len().min(BATCH);
            let from = queue.entries.len() - take;
            local.extend(queue.entries.drain(from..));
            queue.busy += 1;
            drop(queue);

            let aborted = !drain_local(shared, ctx, &mut local, &mut stop);

            queue = shared.lock();
            queue.busy -= 1;
            if aborted {
                queue.aborted = true;
                queue.finished = true;
                shared.work_cv.notify_all();
                return false;
            }
            continue;
        }
        if queue.busy == 0 {
            queue.finished = true;
            shared.work_cv.notify_all();
            return true;
        }
        shared.waiting.fetch_add(1, Ordering::AcqRel);
        if stop.is_some() {
            // The controller wakes up now and then to poll `stop`.
            shared.work_cv.wait_for(queue.inner_mut(), STOP_POLL);
        } else {
            shared.work_cv.wait(queue.inner_mut());
        }
        shared.waiting.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Drains `local`, sharing work with waiting markers. Returns `false` when
/// the cycle was aborted, either by this marker's `stop` or another's.
fn drain_local(
    shared: &MarkShared,
    ctx: &MarkContext<'_>,
    local: &mut MarkStack,
    stop: &mut Option<&mut dyn FnMut() -> bool>,
) -> bool {
    let mut since_poll = 0;
    while let Some(entry) = local.pop() {
        ctx.scan_entry(entry, local);
        since_poll += 1;
        if since_poll < POLL_INTERVAL {
            continue;
        }
        since_poll = 0;
        if shared.aborted.load(Ordering::Acquire) {
            local.clear();
            return false;
        }
        if let Some(stop) = stop.as_mut() {
            if stop() {
                shared.aborted.store(true, Ordering::Release);
                local.clear();
                return false;
            }
        }
        if local.len() > 1 && shared.waiting.load(Ordering::Acquire) > 0 {
            let given = local.split_half();
            let mut queue = shared.lock();
            queue.entries.extend(given);
            shared.work_cv.notify_all();
        }
    }
    true
}
