//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::ptr::NonNull;

use std::ops::Range;

use consgc::{Collector, GcConfig, ThreadHandle};

/// Small heap, no helper markers, nothing unmapped.
pub fn config() -> GcConfig {
    GcConfig::default()
        .with_markers(1)
        .with_initial_heap_size(256 * 1024)
        .with_unmap_after_collections(0)
}

/// Writes word `word` of `obj`.
///
/// # Safety
///
/// `obj` must be a live object of at least `word + 1` words.
pub unsafe fn store(obj: NonNull<u8>, word: usize, value: usize) {
    unsafe { obj.cast::<usize>().add(word).write(value) }
}

/// Reads word `word` of `obj`.
///
/// # Safety
///
/// As for [`store`].
pub unsafe fn load(obj: NonNull<u8>, word: usize) -> usize {
    unsafe { obj.cast::<usize>().add(word).read() }
}

/// Builds a singly linked list of `len` nodes of `bytes` bytes. Word 0 links
/// to the next node, word 1 holds the node's position. Returns the head.
#[inline(never)]
pub fn build_chain(me: &ThreadHandle, len: usize, bytes: usize) -> NonNull<u8> {
    assert!(bytes >= 2 * std::mem::size_of::<usize>());
    let mut head: Option<NonNull<u8>> = None;
    for i in (0..len).rev() {
        let node = me.alloc(bytes).unwrap();
        unsafe {
            store(node, 0, head.map_or(0, |h| h.as_ptr() as usize));
            store(node, 1, i);
        }
        head = Some(node);
    }
    head.unwrap()
}

/// Walks a chain built by [`build_chain`], checking positions.
pub fn walk_chain(head: NonNull<u8>) -> usize {
    let mut count = 0;
    let mut node = Some(head);
    while let Some(n) = node {
        assert_eq!(unsafe { load(n, 1) }, count, "chain node {count} corrupted");
        count += 1;
        node = NonNull::new(unsafe { load(n, 0) } as *mut u8);
    }
    count
}

/// Overwrites dead stack and, with `test-util`, callee-saved registers, so
/// values left by earlier calls stop looking like roots.
#[inline(never)]
pub fn scrub() {
    #[cfg(feature = "test-util")]
    {
        consgc::test_util::clear_stack(64 * 1024);
        consgc::test_util::clear_registers();
    }
    #[cfg(not(feature = "test-util"))]
    clear_stack(64 * 1024);
}

#[cfg(not(feature = "test-util"))]
#[inline(never)]
fn clear_stack(bytes: usize) {
    let mut scratch = [0usize; 128];
    std::hint::black_box(&mut scratch);
    if bytes > 1024 {
        clear_stack(bytes - 1024);
    }
    std::hint::black_box(&scratch);
}

/// Hides a pointer from the conservative scan.
pub fn hide(ptr: NonNull<u8>) -> usize {
    ptr.as_ptr() as usize ^ HIDE_MASK
}

/// Undoes [`hide`].
pub fn reveal(hidden: usize) -> NonNull<u8> {
    NonNull::new((hidden ^ HIDE_MASK) as *mut u8).unwrap()
}

const HIDE_MASK: usize = usize::MAX;

/// Word slots on the Rust heap registered as an explicit root range.
pub struct Roots {
    gc: Collector,
    slots: Box<[usize]>,
}

impl Roots {
    pub fn new(gc: &Collector, len: usize) -> Self {
        let roots = Self {
            gc: gc.clone(),
            slots: vec![0; len].into_boxed_slice(),
        };
        // SAFETY: the slots live as long as the registration.
        unsafe { gc.add_roots(roots.range()) };
        roots
    }

    pub fn range(&self) -> Range<usize> {
        let start = self.slots.as_ptr() as usize;
        start..start + std::mem::size_of_val(&*self.slots)
    }

    pub fn set(&mut self, index: usize, value: usize) {
        self.slots[index] = value;
    }

    pub fn set_ptr(&mut self, index: usize, ptr: NonNull<u8>) {
        self.slots[index] = ptr.as_ptr() as usize;
    }

    pub fn get(&self, index: usize) -> Option<NonNull<u8>> {
        NonNull::new(self.slots[index] as *mut u8)
    }
}

impl Drop for Roots {
    fn drop(&mut self) {
        self.gc.remove_roots(self.range());
    }
}
