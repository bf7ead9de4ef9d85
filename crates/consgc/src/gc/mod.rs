//! Garbage collection: marking, sweeping and the collection driver.
//!
//! - [`engine`]: phase machine, root pushing, sequential mark and sweep
//! - [`marker`]: helper marker pool and the free-list builder count
//! - [`mark`]: mark bitmaps and the mark stack
//! - [`collect`]: one collection end to end, and when to run one
//! - [`sync`]: lock levels and their debug-build checks

pub mod collect;
pub mod engine;
pub mod mark;
pub mod marker;
pub mod sync;

pub use collect::{collection_threshold, AllocCounters, CounterSnapshot};
pub use engine::{MarkContext, MarkEngine, MarkPhase, RootSources, SweepOutcome};
pub use marker::{HelperState, ParallelMarkCoordinator};
