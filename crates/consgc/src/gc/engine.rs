//! Mark and sweep over the block heap.
//!
//! [`MarkEngine`] carries the collection phase and the controller's mark
//! stack. [`MarkContext`] is the read-only view markers share: block map,
//! headers, kind table and black list. Marking only sets atomic mark bits
//! and black-list bits, so any number of markers can use one context.
//!
//! Phases: `Idle → RootsPushed → Marking → Sweeping → Idle`. An aborted
//! collection goes from `RootsPushed` or `Marking` straight back to `Idle`
//! with the free lists untouched.

use std::ptr;

use super::mark::{MarkEntry, MarkStack, MARK_STRIDE};
use crate::error::fatal;
use crate::heap::allocator::SizeClassAllocator;
use crate::heap::block::BlockSlot;
use crate::heap::{BlockSpace, KindTable, LiveTotals, GRANULE_BYTES};
use crate::scan::{for_each_word, split_stride};
use crate::thread::platform::CapturedContext;

/// Where the current collection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkPhase {
    Idle,
    RootsPushed,
    Marking,
    Sweeping,
}

/// Entries popped between stop-predicate polls.
pub const POLL_INTERVAL: usize = 64;

/// Shared view of the heap used by every marker.
pub struct MarkContext<'a> {
    space: &'a BlockSpace,
    kinds: &'a KindTable,
    interior: bool,
    least: usize,
    greatest: usize,
}

impl<'a> MarkContext<'a> {
    #[must_use]
    pub const fn new(space: &'a BlockSpace, kinds: &'a KindTable, interior: bool) -> Self {
        Self {
            space,
            kinds,
            interior,
            least: space.arena.least(),
            greatest: space.arena.greatest(),
        }
    }

    /// Marks the object `value` points at, if any.
    ///
    /// Returns the object's range when it was newly marked and its kind is
    /// scanned. Values inside the heap bounds that hit no object are added
    /// to the black list.
    #[inline]
    pub fn try_mark(&self, value: usize) -> Option<MarkEntry> {
        if value < self.least || value >= self.greatest {
            return None;
        }
        let index = match self.space.map.get(value) {
            BlockSlot::InUse(index) => index,
            BlockSlot::Free | BlockSlot::Unmapped => {
                self.space.black_list.add(value);
                return None;
            }
        };
        let header = self.space.table.get(index);
        let Some(object) = header.locate(value, self.interior) else {
            self.space.black_list.add(value);
            return None;
        };
        if !header.marks.test_and_set(object.index) {
            return None;
        }
        self.kinds
            .get(header.kind)
            .scan
            .then(|| MarkEntry::new(object.start..object.start + header.object_bytes))
    }

    /// Scans at most one stride of `entry`, pushing the remainder and every
    /// newly marked scanned object.
    #[inline]
    pub fn scan_entry(&self, entry: MarkEntry, stack: &mut MarkStack) {
        let (now, rest) = split_stride(entry.range(), MARK_STRIDE);
        if let Some(rest) = rest {
            stack.push(MarkEntry::new(rest));
        }
        // SAFETY: entries are heap objects, registered roots or stopped
        // thread stacks, all readable while the world is stopped.
        unsafe {
            for_each_word(now, |word| {
                if let Some(found) = self.try_mark(word) {
                    stack.push(found);
                }
            });
        }
    }

    /// Marks from single words such as register values.
    pub fn mark_words(&self, words: &[usize], stack: &mut MarkStack) {
        for &word in words {
            if let Some(found) = self.try_mark(word) {
                stack.push(found);
            }
        }
    }

    /// Drains `stack`, polling `stop` every [`POLL_INTERVAL`] entries.
    /// Returns `false` if `stop` asked to abort.
    pub fn drain(&self, stack: &mut MarkStack, stop: &mut dyn FnMut() -> bool) -> bool {
        let mut since_poll = 0;
        while let Some(entry) = stack.pop() {
            self.scan_entry(entry, stack);
            since_poll += 1;
            if since_poll == POLL_INTERVAL {
                since_poll = 0;
                if stop() {
                    return false;
                }
            }
        }
        true
    }
}

/// Root sources gathered for one collection.
#[derive(Debug, Default)]
pub struct RootSources<'a> {
    /// Explicit ranges registered with the collector.
    pub ranges: Vec<std::ops::Range<usize>>,
    /// Stacks and registers of stopped threads, the collector's own included.
    pub threads: Vec<&'a CapturedContext>,
}

/// What one sweep found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub live: LiveTotals,
    pub blocks_freed: usize,
}

/// Phase machine plus the controller's mark stack.
#[derive(Debug)]
pub struct MarkEngine {
    phase: MarkPhase,
    stack: MarkStack,
}

impl MarkEngine {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            phase: MarkPhase::Idle,
            stack: MarkStack::new(),
        }
    }

    #[must_use]
    pub const fn phase(&self) -> MarkPhase {
        self.phase
    }

    fn expect_phase(&self, expected: MarkPhase) {
        if self.phase != expected {
            fatal!("mark engine in phase {:?}, expected {expected:?}", self.phase);
        }
    }

    /// Clears every mark bit except those of uncollectable objects.
    pub fn clear_marks(space: &BlockSpace, kinds: &KindTable) {
        for (_, header) in space.table.iter() {
            if !kinds.get(header.kind).uncollectable {
                header.marks.clear();
            }
        }
    }

    /// `Idle → RootsPushed`: clears marks and seeds the mark stack.
    ///
    /// Root ranges and thread stacks are pushed as entries; register values
    /// are marked right away. Marked uncollectable objects of scanned kinds
    /// are pushed so everything they reference survives.
    pub fn push_roots(&mut self, ctx: &MarkContext<'_>, roots: &RootSources<'_>) {
        self.expect_phase(MarkPhase::Idle);
        Self::clear_marks(ctx.space, ctx.kinds);
        self.stack.clear();

        for range in &roots.ranges {
            self.stack.push(MarkEntry::new(range.clone()));
        }
        for thread in &roots.threads {
            self.stack.push(MarkEntry::new(thread.stack_range()));
            ctx.mark_words(&thread.registers, &mut self.stack);
        }
        for (_, header) in ctx.space.table.iter() {
            let desc = ctx.kinds.get(header.kind);
            if !desc.uncollectable || !desc.scan {
                continue;
            }
            for object in header.marked_objects() {
                self.stack
                    .push(MarkEntry::new(object.start..object.start + header.object_bytes));
            }
        }
        self.phase = MarkPhase::RootsPushed;
    }

    /// `RootsPushed → Marking`, handing the seeded entries to a parallel
    /// coordinator.
    pub fn start_marking(&mut self) -> Vec<MarkEntry> {
        self.expect_phase(MarkPhase::RootsPushed);
        self.phase = MarkPhase::Marking;
        self.stack.take_all()
    }

    /// `RootsPushed → Marking` and marks on the calling thread. Returns
    /// `false` if `stop` aborted the mark.
    pub fn mark_sequential(&mut self, ctx: &MarkContext<'_>, stop: &mut dyn FnMut() -> bool) -> bool {
        self.expect_phase(MarkPhase::RootsPushed);
        self.phase = MarkPhase::Marking;
        ctx.drain(&mut self.stack, stop)
    }

    /// Abandons the current cycle. The free lists were never touched, so
    /// the heap stays as it was before the collection.
    pub fn abort(&mut self) {
        self.stack.clear();
        self.phase = MarkPhase::Idle;
    }

    /// `Marking → Sweeping → Idle`.
    ///
    /// Blocks without marks return to the arena. Other blocks of small
    /// objects get their unmarked objects relinked into the (emptied) global
    /// free lists, zero-filled first for clearing kinds.
    pub fn sweep(
        &mut self,
        space: &mut BlockSpace,
        allocator: &mut SizeClassAllocator,
    ) -> SweepOutcome {
        self.expect_phase(MarkPhase::Marking);
        self.phase = MarkPhase::Sweeping;
        allocator.clear_lists();

        let geometry = space.geometry;
        let mut outcome = SweepOutcome::default();
        for index in space.table.indices() {
            let header = space.table.get(index);
            let desc = *allocator.kinds.get(header.kind);
            let live = header.marks.marked_count();
            if live == 0 {
                outcome.blocks_freed += header.blocks;
                space.free_block(index);
                continue;
            }

            let live_bytes = live * header.object_bytes;
            if desc.scan {
                outcome.live.pointer_bytes += live_bytes;
            } else {
                outcome.live.pointer_free_bytes += live_bytes;
            }
            outcome.live.objects += live;

            if !header.is_large() {
                let (kind, granules) = (header.kind, header.granules);
                let object_bytes = granules * GRANULE_BYTES;
                let list = allocator.list_mut(kind, granules);
                for n in (0..header.capacity(&geometry)).rev() {
                    let object = header.object(n);
                    if header.marks.is_marked(object.index) {
                        continue;
                    }
                    // SAFETY: unmarked objects are unreachable and the world
                    // allocating from this block is blocked on the
                    // allocation lock.
                    unsafe {
                        if desc.clear {
                            ptr::write_bytes(object.start as *mut u8, 0, object_bytes);
                        }
                        list.push(object.start);
                    }
                }
            }
        }
        self.phase = MarkPhase::Idle;
        outcome
    }
}

impl Default for MarkEngine {
    fn default() -> Self {
        Self::new()
    }
}
