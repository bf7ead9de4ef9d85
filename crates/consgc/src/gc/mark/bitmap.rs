//! Per-block mark bitmap.
//!
//! One bit per granule of the block. Only bits at valid object-start
//! granules are ever set, so the set bits enumerate the marked objects and
//! `marked_count` is the number of live objects in the block.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::error::fatal;

/// Atomic mark bits for one heap block.
///
/// # Example
///
/// ```
/// use consgc::gc::mark::MarkBitmap;
///
/// let bitmap = MarkBitmap::new(256);
/// assert!(bitmap.test_and_set(4));
/// assert!(!bitmap.test_and_set(4));
/// assert!(bitmap.is_marked(4));
/// assert_eq!(bitmap.marked_count(), 1);
/// ```
#[derive(Debug)]
pub struct MarkBitmap {
    words: Box<[AtomicU64]>,
    capacity: usize,
    marked_count: AtomicUsize,
}

impl MarkBitmap {
    /// Bitmap with `capacity` bits, all clear.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let words = (0..capacity.div_ceil(64)).map(|_| AtomicU64::new(0)).collect();
        Self {
            words,
            capacity,
            marked_count: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of set bits.
    #[must_use]
    pub fn marked_count(&self) -> usize {
        self.marked_count.load(Ordering::Relaxed)
    }

    /// Sets bit `index`. Returns `true` if this call set it, `false` if it
    /// was already set. An out-of-range index is a fatal heap inconsistency.
    #[inline]
    pub fn test_and_set(&self, index: usize) -> bool {
        let (word, mask) = self.locate(index);
        let prev = self.words[word].fetch_or(mask, Ordering::AcqRel);
        if prev & mask == 0 {
            self.marked_count.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Clears bit `index`. Returns `true` if it was set.
    pub fn unset(&self, index: usize) -> bool {
        let (word, mask) = self.locate(index);
        let prev = self.words[word].fetch_and(!mask, Ordering::AcqRel);
        if prev & mask == 0 {
            false
        } else {
            self.marked_count.fetch_sub(1, Ordering::Relaxed);
            true
        }
    }

    #[inline]
    #[must_use]
    pub fn is_marked(&self, index: usize) -> bool {
        let (word, mask) = self.locate(index);
        self.words[word].load(Ordering::Acquire) & mask != 0
    }

    /// Clear all marks.
    pub fn clear(&self) {
        for word in &*self.words {
            word.store(0, Ordering::Relaxed);
        }
        self.marked_count.store(0, Ordering::Relaxed);
    }

    /// Indices of set bits in ascending order.
    pub fn iter_marked(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(w, word)| {
            let mut bits = word.load(Ordering::Acquire);
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(w * 64 + bit)
            })
        })
    }

    #[inline]
    fn locate(&self, index: usize) -> (usize, u64) {
        if index >= self.capacity {
            fatal!("mark bit index {index} out of range for bitmap of {}", self.capacity);
        }
        (index / 64, 1u64 << (index % 64))
    }
}
