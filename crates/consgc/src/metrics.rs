//! Collection metrics and heap statistics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Statistics from one collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcMetrics {
    /// Collection number (1 for the first completed collection).
    pub collection: u64,
    /// Wall time of the whole collection.
    pub duration: Duration,
    /// Time spent suspending mutators.
    pub stop_duration: Duration,
    /// Time spent pushing roots and marking.
    pub mark_duration: Duration,
    /// Time spent sweeping.
    pub sweep_duration: Duration,
    /// Bytes in use before minus bytes in use after.
    pub bytes_reclaimed: usize,
    /// Bytes in marked objects.
    pub bytes_surviving: usize,
    /// Objects no longer in use after the sweep.
    pub objects_reclaimed: usize,
    /// Marked objects.
    pub objects_surviving: usize,
    /// Blocks handed back to the free block pool.
    pub blocks_freed: usize,
    /// Threads suspended for this collection.
    pub threads_stopped: usize,
    /// Markers that took part, the collecting thread included.
    pub markers: usize,
    /// The stop predicate ended the collection before the sweep.
    pub aborted: bool,
}

impl GcMetrics {
    /// One-line summary used for `print_stats`.
    #[must_use]
    pub fn summary(&self, heap_size: usize) -> String {
        format!(
            "collection {}: {} bytes reclaimed, {} bytes live, {} blocks freed, heap {} bytes, \
             {} threads stopped, {} markers, {:?} total ({:?} stop, {:?} mark, {:?} sweep)",
            self.collection,
            self.bytes_reclaimed,
            self.bytes_surviving,
            self.blocks_freed,
            heap_size,
            self.threads_stopped,
            self.markers,
            self.duration,
            self.stop_duration,
            self.mark_duration,
            self.sweep_duration,
        )
    }
}

/// Times the phases of one collection.
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimer {
    pub stop: Duration,
    pub mark: Duration,
    pub sweep: Duration,
    began: Instant,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            stop: Duration::ZERO,
            mark: Duration::ZERO,
            sweep: Duration::ZERO,
            began: Instant::now(),
            current_start: None,
        }
    }

    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    pub fn end_stop(&mut self) -> Duration {
        self.stop = self.lap();
        self.stop
    }

    pub fn end_mark(&mut self) -> Duration {
        self.mark = self.lap();
        self.mark
    }

    pub fn end_sweep(&mut self) -> Duration {
        self.sweep = self.lap();
        self.sweep
    }

    /// Time since the timer was created.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.began.elapsed()
    }

    fn lap(&mut self) -> Duration {
        self.current_start
            .take()
            .map_or(Duration::ZERO, |start| start.elapsed())
    }
}

impl Default for PhaseTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Cumulative counters for one collector.
#[derive(Debug, Default)]
pub struct CollectorMetrics {
    collections: AtomicU64,
    aborted: AtomicU64,
    bytes_reclaimed: AtomicUsize,
    objects_reclaimed: AtomicUsize,
    pause_ns: AtomicU64,
    black_listed_placements: AtomicUsize,
    last: Mutex<GcMetrics>,
}

impl CollectorMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, metrics: &GcMetrics) {
        if metrics.aborted {
            self.aborted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.collections.fetch_add(1, Ordering::Relaxed);
            self.bytes_reclaimed
                .fetch_add(metrics.bytes_reclaimed, Ordering::Relaxed);
            self.objects_reclaimed
                .fetch_add(metrics.objects_reclaimed, Ordering::Relaxed);
        }
        let pause = u64::try_from(metrics.duration.as_nanos()).unwrap_or(u64::MAX);
        self.pause_ns.fetch_add(pause, Ordering::Relaxed);
        *self.last.lock() = *metrics;
    }

    pub(crate) fn record_black_listed_placement(&self) {
        self.black_listed_placements.fetch_add(1, Ordering::Relaxed);
    }

    /// Completed collections.
    #[inline]
    #[must_use]
    pub fn total_collections(&self) -> u64 {
        self.collections.load(Ordering::Relaxed)
    }

    /// Collections ended by the stop predicate.
    #[inline]
    #[must_use]
    pub fn total_aborted(&self) -> u64 {
        self.aborted.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn total_bytes_reclaimed(&self) -> usize {
        self.bytes_reclaimed.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn total_objects_reclaimed(&self) -> usize {
        self.objects_reclaimed.load(Ordering::Relaxed)
    }

    /// Sum of collection durations in nanoseconds.
    #[inline]
    #[must_use]
    pub fn total_pause_ns(&self) -> u64 {
        self.pause_ns.load(Ordering::Relaxed)
    }

    /// Allocations that had to use black-listed blocks.
    #[inline]
    #[must_use]
    pub fn black_listed_placements(&self) -> usize {
        self.black_listed_placements.load(Ordering::Relaxed)
    }

    /// Metrics of the most recent collection, aborted ones included.
    #[must_use]
    pub fn last(&self) -> GcMetrics {
        *self.last.lock()
    }
}

/// Snapshot of heap occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes of heap blocks, free or not.
    pub heap_size: usize,
    /// Bytes in the free block pool.
    pub free_bytes: usize,
    /// Free bytes whose pages were returned to the OS.
    pub unmapped_bytes: usize,
    /// Bytes in objects considered in use: live at the last collection plus
    /// allocated since, minus explicitly released.
    pub bytes_in_use: usize,
    /// The part of `bytes_in_use` in scanned (pointer-containing) kinds.
    pub pointer_bytes: usize,
    /// The part of `bytes_in_use` in pointer-free kinds.
    pub pointer_free_bytes: usize,
    /// Bytes allocated since the last collection.
    pub bytes_since_gc: usize,
    /// Completed collections.
    pub gc_count: u64,
}
