//! Explicitly registered root ranges (static data, host-owned buffers).

use std::ops::Range;

/// Sorted, non-overlapping address ranges scanned on every collection.
#[derive(Debug, Default, Clone)]
pub struct RootSet {
    ranges: Vec<Range<usize>>,
}

impl RootSet {
    #[must_use]
    pub const fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Adds `range`, merging it with ranges it overlaps or touches.
    pub fn add(&mut self, range: Range<usize>) {
        if range.is_empty() {
            return;
        }
        let mut merged = range;
        self.ranges.retain(|r| {
            let touches = r.start <= merged.end && merged.start <= r.end;
            if touches {
                merged = merged.start.min(r.start)..merged.end.max(r.end);
            }
            !touches
        });
        let pos = self.ranges.partition_point(|r| r.start < merged.start);
        self.ranges.insert(pos, merged);
    }

    /// Removes every registered range lying entirely within `range`.
    pub fn remove(&mut self, range: Range<usize>) {
        self.ranges
            .retain(|r| !(r.start >= range.start && r.end <= range.end));
    }

    pub fn iter(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        self.ranges.iter().cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
