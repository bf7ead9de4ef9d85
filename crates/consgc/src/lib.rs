//! A conservative mark-sweep garbage collector for embedding in a host
//! process.
//!
//! `consgc` manages a heap of fixed-size blocks in the **`BiBOP` (Big Bag of
//! Pages)** style: every block holds objects of one size class and one
//! kind, and object headers live out of line. Liveness is found by scanning
//! memory for anything that looks like a pointer into the heap, so hosts
//! need no type information and no write barriers.
//!
//! # Features
//!
//! - **Conservative roots**: registered thread stacks, callee-saved
//!   registers and explicit root ranges
//! - **Black-listing**: blocks that false pointers already hit are avoided
//!   for new objects
//! - **Thread-local allocation caches** refilled a block at a time, with
//!   blocks carved outside the allocation lock
//! - **Parallel marking** with a persistent helper pool
//! - **Stop predicate** to abandon a collection that takes too long
//!
//! # Quick Start
//!
//! ```
//! use consgc::{Collector, GcConfig};
//!
//! let gc = Collector::new(GcConfig::default().with_markers(1)).unwrap();
//! let me = gc.register_current_thread().unwrap();
//!
//! // A two-word node whose first word points at another node.
//! let tail = me.alloc(16).unwrap();
//! let head = me.alloc(16).unwrap();
//! unsafe { head.cast::<usize>().write(tail.as_ptr() as usize) };
//!
//! // `head` is on this stack, so both survive.
//! assert!(me.collect());
//! assert!(gc.is_marked(tail.as_ptr()));
//! ```
//!
//! # Threads
//!
//! Every thread that allocates registers with the collector and holds a
//! [`ThreadHandle`]. Collections stop registered threads at safepoints
//! (allocation or [`ThreadHandle::safepoint`]); a thread waiting on
//! something else wraps the wait in [`ThreadHandle::do_blocking`].

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod collector;
pub mod config;
pub mod error;
pub mod metrics;
mod scan;
mod stack;
pub mod tracing;

/// Mark engine, parallel marker and collection driver.
///
/// Public for testing and for hosts that drive the pieces themselves.
pub mod gc;

/// `BiBOP` memory management internals.
///
/// Public for testing and advanced use cases. Most users only need
/// [`Collector`] and [`ThreadHandle`].
pub mod heap;

/// Thread registration and stop-the-world.
pub mod thread;

// Re-export public API
pub use collector::{Collector, HeapCheckError, StopPredicate};
pub use config::{GcConfig, OomHandler};
pub use error::GcError;
pub use heap::{MemorySource, ObjectKind, SystemMemory};
pub use metrics::{CollectorMetrics, GcMetrics, HeapStats};
pub use stack::{current_stack_base, current_stack_bounds, StackBounds};
pub use thread::{
    CapturedContext, CooperativeThreadControl, PlatformThreadControl, SuspendState, ThreadHandle,
    ThreadRecord, ThreadStatus,
};

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util {
    //! Helpers that make conservative liveness deterministic in tests.

    /// Zero callee-saved registers so a stale pointer left in one does not
    /// keep an object alive.
    pub use crate::stack::clear_registers;

    /// Overwrite dead stack below the caller with zeros.
    pub use crate::stack::clear_stack;
}
