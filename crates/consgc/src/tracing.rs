//! Structured logging for collections.
//!
//! With the `tracing` feature every collection runs inside a `gc_collect`
//! span tagged with its [`GcId`], phases get their own spans, and heap
//! growth, decommit and helper lifecycle are debug events. Without the
//! feature the same functions compile to nothing, except warnings, which are
//! printed to stderr.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Identifier correlating all events of one collection.
///
/// Monotonically increasing, starting at 1, shared by all collectors in the
/// process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GcId(pub u64);

static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

/// Generate the next collection id.
pub fn next_gc_id() -> GcId {
    GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
}

/// Phases of one collection as they appear in spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// Suspending mutators.
    StopWorld,
    /// Clearing marks and pushing roots.
    Roots,
    /// Tracing from the roots.
    Mark,
    /// Rebuilding free lists and returning empty blocks.
    Sweep,
}

#[cfg(feature = "tracing")]
mod internal {
    use super::{Duration, GcId, GcPhase};
    use tracing::{span, Level};

    pub type SpanGuard = span::EnteredSpan;

    pub fn trace_collection(trigger: &'static str, gc_id: GcId) -> SpanGuard {
        span!(Level::DEBUG, "gc_collect", trigger, gc_id = gc_id.0).entered()
    }

    pub fn trace_phase(phase: GcPhase) -> SpanGuard {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    pub fn log_phase_end(phase: GcPhase, elapsed: Duration) {
        tracing::debug!(phase = ?phase, elapsed_us = elapsed.as_micros(), "phase_end");
    }

    pub fn log_world_stopped(threads: usize, elapsed: Duration) {
        tracing::debug!(threads, elapsed_us = elapsed.as_micros(), "world_stopped");
    }

    pub fn log_heap_growth(added: usize, heap_size: usize) {
        tracing::debug!(added, heap_size, "heap_grown");
    }

    pub fn log_decommit(bytes: usize) {
        tracing::debug!(bytes, "free_blocks_decommitted");
    }

    pub fn log_marker(index: usize, event: &'static str) {
        tracing::trace!(index, event, "mark_helper");
    }

    pub fn warn_black_listed_placement(addr: usize, blocks: usize) {
        tracing::warn!(
            addr = format_args!("{addr:#x}"),
            blocks,
            "allocating black-listed blocks; heap cannot grow"
        );
    }

    pub fn warn_collection_aborted(gc_id: GcId) {
        tracing::warn!(gc_id = gc_id.0, "collection aborted by stop predicate");
    }

    pub fn log_summary(line: &str) {
        tracing::info!("{line}");
    }
}

#[cfg(not(feature = "tracing"))]
mod internal {
    use super::{Duration, GcId, GcPhase};

    pub struct SpanGuard;

    pub const fn trace_collection(_trigger: &'static str, _gc_id: GcId) -> SpanGuard {
        SpanGuard
    }

    pub const fn trace_phase(_phase: GcPhase) -> SpanGuard {
        SpanGuard
    }

    pub const fn log_phase_end(_phase: GcPhase, _elapsed: Duration) {}

    pub const fn log_world_stopped(_threads: usize, _elapsed: Duration) {}

    pub const fn log_heap_growth(_added: usize, _heap_size: usize) {}

    pub const fn log_decommit(_bytes: usize) {}

    pub const fn log_marker(_index: usize, _event: &'static str) {}

    pub fn warn_black_listed_placement(addr: usize, blocks: usize) {
        eprintln!("[GC] allocating {blocks} black-listed block(s) at {addr:#x}; heap cannot grow");
    }

    pub fn warn_collection_aborted(gc_id: GcId) {
        eprintln!("[GC] collection {} aborted by stop predicate", gc_id.0);
    }

    pub fn log_summary(line: &str) {
        eprintln!("[GC] {line}");
    }
}

pub use internal::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gc_ids_increase() {
        let a = next_gc_id();
        let b = next_gc_id();
        assert!(b > a);
    }
}
