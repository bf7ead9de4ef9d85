//! Driving one collection, and deciding when to run one.
//!
//! A collection runs with the allocation lock held from start to finish:
//! wait for in-flight free-list builders, stop the world, seed roots, mark
//! (alone or with the helper pool), drop every thread cache, resume, sweep.
//! When the stop predicate fires before the sweep, marks are abandoned and
//! the heap is left exactly as it was.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::engine::{MarkContext, RootSources};
use crate::collector::Shared;
use crate::heap::Heap;
use crate::metrics::{GcMetrics, PhaseTimer};
use crate::stack::{with_spilled_registers, SpilledContext};
use crate::thread::platform::CapturedContext;
use crate::thread::registry::ThreadRecord;
use crate::tracing::{
    log_phase_end, log_summary, log_world_stopped, next_gc_id, trace_collection, trace_phase,
    warn_black_listed_placement, warn_collection_aborted, GcPhase,
};

/// Allocation and explicit-free totals since the last completed collection.
#[derive(Debug, Default)]
pub struct AllocCounters {
    bytes_allocated: AtomicUsize,
    scanned_allocated: AtomicUsize,
    objects_allocated: AtomicUsize,
    bytes_freed: AtomicUsize,
    scanned_freed: AtomicUsize,
    objects_freed: AtomicUsize,
}

/// Values of [`AllocCounters`] taken when a collection resets them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub bytes_allocated: usize,
    pub scanned_allocated: usize,
    pub objects_allocated: usize,
    pub bytes_freed: usize,
    pub scanned_freed: usize,
    pub objects_freed: usize,
}

impl CounterSnapshot {
    /// `base` plus what was allocated, minus what was freed.
    #[must_use]
    pub const fn apply(&self, base: usize) -> usize {
        base.saturating_add(self.bytes_allocated)
            .saturating_sub(self.bytes_freed)
    }
}

impl AllocCounters {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bytes_allocated: AtomicUsize::new(0),
            scanned_allocated: AtomicUsize::new(0),
            objects_allocated: AtomicUsize::new(0),
            bytes_freed: AtomicUsize::new(0),
            scanned_freed: AtomicUsize::new(0),
            objects_freed: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn record_alloc(&self, bytes: usize, scanned: bool) {
        self.bytes_allocated.fetch_add(bytes, Ordering::Relaxed);
        if scanned {
            self.scanned_allocated.fetch_add(bytes, Ordering::Relaxed);
        }
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_free(&self, bytes: usize, scanned: bool) {
        self.bytes_freed.fetch_add(bytes, Ordering::Relaxed);
        if scanned {
            self.scanned_freed.fetch_add(bytes, Ordering::Relaxed);
        }
        self.objects_freed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    #[must_use]
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            bytes_allocated: self.bytes_allocated.load(Ordering::Relaxed),
            scanned_allocated: self.scanned_allocated.load(Ordering::Relaxed),
            objects_allocated: self.objects_allocated.load(Ordering::Relaxed),
            bytes_freed: self.bytes_freed.load(Ordering::Relaxed),
            scanned_freed: self.scanned_freed.load(Ordering::Relaxed),
            objects_freed: self.objects_freed.load(Ordering::Relaxed),
        }
    }

    /// Returns the current values and zeroes the counters.
    pub fn take(&self) -> CounterSnapshot {
        CounterSnapshot {
            bytes_allocated: self.bytes_allocated.swap(0, Ordering::Relaxed),
            scanned_allocated: self.scanned_allocated.swap(0, Ordering::Relaxed),
            objects_allocated: self.objects_allocated.swap(0, Ordering::Relaxed),
            bytes_freed: self.bytes_freed.swap(0, Ordering::Relaxed),
            scanned_freed: self.scanned_freed.swap(0, Ordering::Relaxed),
            objects_freed: self.objects_freed.swap(0, Ordering::Relaxed),
        }
    }
}

/// Allocation threshold: `max(min_bytes, heap_size / divisor)`.
#[inline]
#[must_use]
pub const fn collection_threshold(heap_size: usize, divisor: usize, min_bytes: usize) -> usize {
    let share = if divisor == 0 { heap_size } else { heap_size / divisor };
    if share > min_bytes {
        share
    } else {
        min_bytes
    }
}

/// Progress through the fallbacks of one failing allocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetryState {
    collected: bool,
    expand_failed: bool,
    pub allow_black_listed: bool,
    collected_again: bool,
}

/// What [`Shared::make_room`] achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Room {
    /// Something changed; try the allocation again.
    Retry,
    /// Every fallback is used up.
    Exhausted,
}

impl Shared {
    /// Whether collections may run at all right now.
    #[inline]
    pub(crate) fn collection_enabled(&self) -> bool {
        !self.config.dont_gc && self.disabled.load(Ordering::Acquire) == 0
    }

    /// Whether enough was allocated since the last collection to collect
    /// instead of growing the heap.
    pub(crate) fn should_collect(&self, heap: &Heap) -> bool {
        let threshold = collection_threshold(
            heap.space.arena.heap_size(),
            self.config.free_space_divisor,
            self.config.min_bytes_between_collections,
        );
        self.counters.bytes_allocated() >= threshold
    }

    /// One step of the fallback chain for an allocation that found no
    /// block: collect if due, grow the heap, accept a black-listed
    /// placement, collect regardless, give up.
    pub(crate) fn make_room(
        &self,
        heap: &mut Heap,
        me: Option<&ThreadRecord>,
        retry: &mut RetryState,
        bytes: usize,
    ) -> Room {
        if !retry.collected {
            retry.collected = true;
            if self.collection_enabled()
                && self.should_collect(heap)
                && self.collect_locked(heap, me, "allocation")
            {
                return Room::Retry;
            }
        }
        if !retry.expand_failed {
            let divisor = self.config.free_space_divisor.max(1);
            let want = bytes.saturating_add(heap.space.arena.heap_size() / divisor);
            if heap.space.expand(want).or_else(|_| heap.space.expand(bytes)).is_ok() {
                return Room::Retry;
            }
            retry.expand_failed = true;
        }
        if !retry.allow_black_listed {
            retry.allow_black_listed = true;
            return Room::Retry;
        }
        if !retry.collected_again {
            retry.collected_again = true;
            if self.collect_locked(heap, me, "out_of_memory") {
                return Room::Retry;
            }
        }
        Room::Exhausted
    }

    pub(crate) fn note_black_listed(&self, addr: usize, blocks: usize) {
        self.metrics.record_black_listed_placement();
        warn_black_listed_placement(addr, blocks);
    }

    /// Runs a collection with the allocation lock held. `me` is the calling
    /// thread's record if it is registered. Returns `false` when collection
    /// is disabled or the stop predicate aborted it.
    pub(crate) fn collect_locked(
        &self,
        heap: &mut Heap,
        me: Option<&ThreadRecord>,
        trigger: &'static str,
    ) -> bool {
        if !self.collection_enabled() {
            return false;
        }
        with_spilled_registers(|own| self.collect_with_context(heap, me, trigger, own))
    }

    fn own_context(&self, me: Option<&ThreadRecord>, own: &SpilledContext) -> Option<CapturedContext> {
        let base = me?.stack_base();
        Some(CapturedContext {
            stack_pointer: own.stack_pointer,
            stack_base: base,
            registers: own.registers.to_vec(),
        })
    }

    #[allow(clippy::too_many_lines)]
    fn collect_with_context(
        &self,
        heap: &mut Heap,
        me: Option<&ThreadRecord>,
        trigger: &'static str,
        own: &SpilledContext,
    ) -> bool {
        let gc_id = next_gc_id();
        let _span = trace_collection(trigger, gc_id);
        let mut timer = PhaseTimer::new();
        let collection = heap.gc_no + 1;
        let stop_predicate = self.hooks().stop.clone();
        let mut stop = || stop_predicate.as_ref().is_some_and(|f| f());

        self.marker.wait_for_builders();

        timer.start();
        let world = {
            let _phase = trace_phase(GcPhase::StopWorld);
            self.world.stop_world(&self.registry, me)
        };
        let stop_duration = timer.end_stop();
        log_world_stopped(world.threads.len(), world.elapsed);
        log_phase_end(GcPhase::StopWorld, stop_duration);

        let own_context = self.own_context(me, own);
        let markers = self.marker.helpers() + 1;
        timer.start();
        let completed = {
            let Heap {
                space,
                allocator,
                roots,
                engine,
                ..
            } = &mut *heap;
            let ctx = MarkContext::new(space, &allocator.kinds, self.config.interior_pointers);
            let mut sources = RootSources {
                ranges: roots.iter().collect(),
                threads: Vec::new(),
            };
            if self.config.scan_stacks {
                sources.threads.extend(world.contexts());
                sources.threads.extend(own_context.as_ref());
            }

            let seeded = {
                let _phase = trace_phase(GcPhase::Roots);
                if stop() {
                    false
                } else {
                    engine.push_roots(&ctx, &sources);
                    true
                }
            };
            seeded && {
                let _phase = trace_phase(GcPhase::Mark);
                if self.marker.helpers() > 0 {
                    let entries = engine.start_marking();
                    self.marker.mark(&ctx, entries, &mut stop)
                } else {
                    engine.mark_sequential(&ctx, &mut stop)
                }
            }
        };
        let mark_duration = timer.end_mark();
        log_phase_end(GcPhase::Mark, mark_duration);

        if !completed {
            heap.engine.abort();
            heap.space.black_list.demote();
            let threads_stopped = world.suspended_count();
            self.world.resume_world(&self.registry, world);
            warn_collection_aborted(gc_id);
            self.metrics.record(&GcMetrics {
                collection,
                duration: timer.total(),
                stop_duration,
                mark_duration,
                threads_stopped,
                markers,
                aborted: true,
                ..GcMetrics::default()
            });
            return false;
        }

        for thread in &world.threads {
            thread.record.lock_cache().discard();
        }
        if let Some(me) = me {
            me.lock_cache().discard();
        }
        let counters = self.counters.take();
        let before = counters.apply(heap.live.pointer_bytes + heap.live.pointer_free_bytes);
        let objects_before = (heap.live.objects + counters.objects_allocated)
            .saturating_sub(counters.objects_freed);
        let threads_stopped = world.suspended_count();
        self.world.resume_world(&self.registry, world);

        timer.start();
        let outcome = {
            let _phase = trace_phase(GcPhase::Sweep);
            let Heap {
                space,
                allocator,
                engine,
                ..
            } = &mut *heap;
            engine.sweep(space, allocator)
        };
        let sweep_duration = timer.end_sweep();
        log_phase_end(GcPhase::Sweep, sweep_duration);

        heap.gc_no = collection;
        heap.live = outcome.live;
        heap.space.black_list.promote();
        heap.space.arena.set_epoch(collection);
        heap.space
            .arena
            .decommit_idle(self.config.unmap_after_collections);

        let after = outcome.live.pointer_bytes + outcome.live.pointer_free_bytes;
        let metrics = GcMetrics {
            collection,
            duration: timer.total(),
            stop_duration,
            mark_duration,
            sweep_duration,
            bytes_reclaimed: before.saturating_sub(after),
            bytes_surviving: after,
            objects_reclaimed: objects_before.saturating_sub(outcome.live.objects),
            objects_surviving: outcome.live.objects,
            blocks_freed: outcome.blocks_freed,
            threads_stopped,
            markers,
            aborted: false,
        };
        self.metrics.record(&metrics);
        if self.config.print_stats {
            log_summary(&metrics.summary(heap.space.arena.heap_size()));
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_uses_larger_bound() {
        assert_eq!(collection_threshold(3 << 20, 3, 64 << 10), 1 << 20);
        assert_eq!(collection_threshold(96 << 10, 3, 64 << 10), 64 << 10);
        assert_eq!(collection_threshold(1 << 20, 0, 0), 1 << 20);
    }

    #[test]
    fn take_resets_counters() {
        let counters = AllocCounters::new();
        counters.record_alloc(64, true);
        counters.record_alloc(32, false);
        counters.record_free(64, true);
        let snap = counters.take();
        assert_eq!(snap.bytes_allocated, 96);
        assert_eq!(snap.scanned_allocated, 64);
        assert_eq!(snap.objects_allocated, 2);
        assert_eq!(snap.apply(0), 32);
        assert_eq!(snap.apply(100), 132);
        assert_eq!(counters.snapshot(), CounterSnapshot::default());
    }
}
