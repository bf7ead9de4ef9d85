//! Word-by-word reading of memory ranges that may hold pointers.

use std::ops::Range;

use crate::heap::WORD;

/// First word-aligned address at or above `addr`.
#[inline]
#[must_use]
pub const fn align_up(addr: usize) -> usize {
    (addr + WORD - 1) & !(WORD - 1)
}

/// Calls `f` with every aligned word in `range`. Trailing bytes that do not
/// form a full word are ignored.
///
/// # Safety
///
/// `range` must be readable for the duration of the call. Other threads may
/// write to it; each word is read with a single volatile load.
#[inline]
pub unsafe fn for_each_word(range: Range<usize>, mut f: impl FnMut(usize)) {
    let mut current = align_up(range.start);
    while current + WORD <= range.end {
        // SAFETY: in bounds and aligned, readable per the caller.
        let word = unsafe { std::ptr::read_volatile(current as *const usize) };
        f(word);
        current += WORD;
    }
}

/// Splits `range` into a first piece of at most `stride` bytes and the rest.
#[inline]
#[must_use]
pub fn split_stride(range: Range<usize>, stride: usize) -> (Range<usize>, Option<Range<usize>>) {
    if range.end - range.start <= stride {
        (range, None)
    } else {
        let mid = range.start + stride;
        (range.start..mid, Some(mid..range.end))
    }
}
