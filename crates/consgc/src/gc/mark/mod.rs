//! Mark bits and the mark stack.

pub mod bitmap;

use std::ops::Range;

pub use bitmap::MarkBitmap;

/// Bytes scanned from one entry before the remainder goes back on the
/// stack, so large objects and stacks can be shared between markers.
pub const MARK_STRIDE: usize = 4096;

/// An address range still to be scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkEntry {
    pub start: usize,
    pub end: usize,
}

impl MarkEntry {
    #[inline]
    #[must_use]
    pub const fn new(range: Range<usize>) -> Self {
        Self {
            start: range.start,
            end: range.end,
        }
    }

    #[inline]
    #[must_use]
    pub const fn range(self) -> Range<usize> {
        self.start..self.end
    }

    #[inline]
    #[must_use]
    pub const fn len(self) -> usize {
        self.end.saturating_sub(self.start)
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.len() == 0
    }
}

/// LIFO stack of pending ranges.
#[derive(Debug, Default)]
pub struct MarkStack {
    entries: Vec<MarkEntry>,
}

impl MarkStack {
    #[must_use]
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    #[inline]
    pub fn push(&mut self, entry: MarkEntry) {
        if !entry.is_empty() {
            self.entries.push(entry);
        }
    }

    #[inline]
    pub fn pop(&mut self) -> Option<MarkEntry> {
        self.entries.pop()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = MarkEntry>) {
        self.entries
            .extend(entries.into_iter().filter(|e| !e.is_empty()));
    }

    /// Removes and returns the older half of the entries (the bottom of the
    /// stack), leaving the newer half to the owner.
    pub fn split_half(&mut self) -> Vec<MarkEntry> {
        let give = self.entries.len() / 2;
        self.entries.drain(..give).collect()
    }

    /// Removes and returns everything.
    pub fn take_all(&mut self) -> Vec<MarkEntry> {
        std::mem::take(&mut self.entries)
    }
}
