//! Black-listing of addresses that look like pointers but are not.
//!
//! During scanning, values that fall inside the plausible heap range but do
//! not hit an allocated object (unmapped gaps, free blocks, padding) are
//! recorded here. The block placer avoids handing out blocks at those
//! addresses, because a stale integer or stray value already "points" there
//! and would pin any object placed on it.
//!
//! Two generations are kept. Scanning writes `incomplete`; a completed
//! collection promotes it to `old`, so an entry survives exactly as long as
//! some scan keeps finding the value. An aborted collection folds `old`
//! back into `incomplete` so nothing found so far is lost.

use std::sync::atomic::{AtomicU64, Ordering};

/// Set of block addresses with possible false positives.
pub trait AddressSet: Send + Sync {
    fn contains(&self, addr: usize) -> bool;
    /// Adds `addr`. Callable through a shared reference from several markers.
    fn mark(&self, addr: usize);
    fn clear(&mut self);
    /// Adds every member of `other`.
    fn union_with(&mut self, other: &Self);
}

/// Fixed-size bit table indexed by a hash of the block number.
#[derive(Debug)]
pub struct HashedBitTable {
    words: Box<[AtomicU64]>,
    log_block: u32,
    mask: usize,
}

impl HashedBitTable {
    /// Table of `1 << log_entries` bits for blocks of `1 << log_block` bytes.
    #[must_use]
    pub fn new(log_entries: u32, log_block: u32) -> Self {
        let entries = 1usize << log_entries;
        let words = (0..entries.div_ceil(64)).map(|_| AtomicU64::new(0)).collect();
        Self {
            words,
            log_block,
            mask: entries - 1,
        }
    }

    #[inline]
    const fn slot(&self, addr: usize) -> (usize, u64) {
        let index = (addr >> self.log_block) & self.mask;
        (index / 64, 1u64 << (index % 64))
    }

    #[cfg(test)]
    fn population(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }
}

impl AddressSet for HashedBitTable {
    #[inline]
    fn contains(&self, addr: usize) -> bool {
        let (word, bit) = self.slot(addr);
        self.words[word].load(Ordering::Relaxed) & bit != 0
    }

    #[inline]
    fn mark(&self, addr: usize) {
        let (word, bit) = self.slot(addr);
        // Plain load first: most values hit an already-set bit.
        if self.words[word].load(Ordering::Relaxed) & bit == 0 {
            self.words[word].fetch_or(bit, Ordering::Relaxed);
        }
    }

    fn clear(&mut self) {
        for word in &mut *self.words {
            *word.get_mut() = 0;
        }
    }

    fn union_with(&mut self, other: &Self) {
        debug_assert_eq!(self.words.len(), other.words.len());
        for (dst, src) in self.words.iter_mut().zip(&*other.words) {
            *dst.get_mut() |= src.load(Ordering::Relaxed);
        }
    }
}

/// Old and incomplete generations of black-listed block addresses.
#[derive(Debug)]
pub struct BlackList<S: AddressSet = HashedBitTable> {
    old: S,
    incomplete: S,
}

impl BlackList<HashedBitTable> {
    #[must_use]
    pub fn new(log_entries: u32, log_block: u32) -> Self {
        Self::with_sets(
            HashedBitTable::new(log_entries, log_block),
            HashedBitTable::new(log_entries, log_block),
        )
    }

    #[cfg(test)]
    fn population(&self) -> usize {
        self.old.population().max(self.incomplete.population())
    }
}

impl<S: AddressSet> BlackList<S> {
    pub const fn with_sets(old: S, incomplete: S) -> Self {
        Self { old, incomplete }
    }

    /// Whether the block containing `addr` is black-listed in either
    /// generation.
    #[inline]
    pub fn is_black_listed(&self, addr: usize) -> bool {
        self.old.contains(addr) || self.incomplete.contains(addr)
    }

    /// Records a false-pointer candidate found by the current scan.
    #[inline]
    pub fn add(&self, addr: usize) {
        self.incomplete.mark(addr);
    }

    /// Highest black-listed block start in `[start, start + len)`, stepping
    /// by `block_size`.
    pub fn last_black_listed(&self, start: usize, len: usize, block_size: usize) -> Option<usize> {
        (0..len / block_size)
            .rev()
            .map(|i| start + i * block_size)
            .find(|&addr| self.is_black_listed(addr))
    }

    /// End of a completed collection: the incomplete generation becomes old.
    pub fn promote(&mut self) {
        std::mem::swap(&mut self.old, &mut self.incomplete);
        self.incomplete.clear();
    }

    /// Aborted collection: keep what the old generation knew alongside the
    /// partial scan.
    pub fn demote(&mut self) {
        self.incomplete.union_with(&self.old);
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.old.clear();
        self.incomplete.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG_BLOCK: u32 = 12;
    const BLOCK: usize = 1 << LOG_BLOCK;

    #[test]
    fn entries_cover_whole_block() {
        let list = BlackList::new(10, LOG_BLOCK);
        list.add(0x10_0000 + 24);
        assert!(list.is_black_listed(0x10_0000));
        assert!(list.is_black_listed(0x10_0000 + BLOCK - 1));
        assert!(!list.is_black_listed(0x10_0000 + BLOCK));
    }

    #[test]
    fn entry_survives_one_promotion_without_rediscovery() {
        let mut list = BlackList::new(10, LOG_BLOCK);
        let addr = 0x40_0000;
        list.add(addr);
        list.promote();
        assert!(list.is_black_listed(addr));
        list.promote();
        assert!(!list.is_black_listed(addr));
    }

    #[test]
    fn demote_keeps_old_entries() {
        let mut list = BlackList::new(10, LOG_BLOCK);
        list.add(0x40_0000);
        list.promote();
        list.add(0x40_0000 + 5 * BLOCK);
        list.demote();
        list.promote();
        assert!(list.is_black_listed(0x40_0000));
        assert!(list.is_black_listed(0x40_0000 + 5 * BLOCK));
    }

    #[test]
    fn last_black_listed_scans_down() {
        let list = BlackList::new(12, LOG_BLOCK);
        let base = 0x100_0000;
        list.add(base + BLOCK);
        list.add(base + 3 * BLOCK);
        assert_eq!(list.last_black_listed(base, 8 * BLOCK, BLOCK), Some(base + 3 * BLOCK));
        assert_eq!(list.last_black_listed(base, BLOCK, BLOCK), None);
    }

    #[test]
    fn clear_empties_both_generations() {
        let mut list = BlackList::new(10, LOG_BLOCK);
        list.add(0x40_0000);
        list.promote();
        list.add(0x80_0000);
        list.clear();
        assert_eq!(list.population(), 0);
    }
}
