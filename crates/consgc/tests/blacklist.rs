//! Black-listing of blocks that false pointers hit.

mod common;

use consgc::Collector;

use common::Roots;

const BLOCK: usize = 4096;

#[test]
fn test_false_pointer_black_lists_free_block() {
    let gc = Collector::new(common::config().with_scan_stacks(false)).unwrap();
    let me = gc.register_current_thread().unwrap();
    let mut roots = Roots::new(&gc, 64);

    let first = me.alloc(64).unwrap();
    roots.set_ptr(0, first);
    let block0 = first.as_ptr() as usize & !(BLOCK - 1);
    let fake = block0 + 8 * BLOCK + 64;
    assert!(!gc.is_heap_ptr(fake as *const u8));
    roots.set(1, fake);

    assert!(me.collect());
    assert!(gc.is_black_listed(fake));
    assert!(!gc.is_black_listed(block0 + 4 * BLOCK));

    // One-block objects are placed around the black-listed block.
    for slot in 2..42 {
        let obj = me.alloc(BLOCK).unwrap();
        roots.set_ptr(slot, obj);
        let start = obj.as_ptr() as usize & !(BLOCK - 1);
        assert_ne!(start, fake & !(BLOCK - 1), "allocation {slot} landed on a black-listed block");
    }
    assert_eq!(gc.metrics().black_listed_placements(), 0);

    // Still referenced, so still black-listed after another collection.
    assert!(me.collect());
    assert!(gc.is_black_listed(fake));
}

#[test]
fn test_black_list_expires_when_false_pointer_goes_away() {
    let gc = Collector::new(common::config().with_scan_stacks(false)).unwrap();
    let me = gc.register_current_thread().unwrap();
    let mut roots = Roots::new(&gc, 2);

    let first = me.alloc(64).unwrap();
    roots.set_ptr(0, first);
    let fake = (first.as_ptr() as usize & !(BLOCK - 1)) + 16 * BLOCK;
    roots.set(1, fake);
    assert!(me.collect());
    assert!(gc.is_black_listed(fake));

    roots.set(1, 0);
    assert!(me.collect());
    assert!(!gc.is_black_listed(fake));
}

#[test]
fn test_clear_black_list() {
    let gc = Collector::new(common::config().with_scan_stacks(false)).unwrap();
    let me = gc.register_current_thread().unwrap();
    let mut roots = Roots::new(&gc, 2);

    let first = me.alloc(64).unwrap();
    roots.set_ptr(0, first);
    let fake = (first.as_ptr() as usize & !(BLOCK - 1)) + 12 * BLOCK + 8;
    roots.set(1, fake);
    assert!(me.collect());
    assert!(gc.is_black_listed(fake));

    gc.clear_black_list();
    assert!(!gc.is_black_listed(fake));
}

#[test]
fn test_pointers_outside_heap_are_ignored() {
    let gc = Collector::new(common::config().with_scan_stacks(false)).unwrap();
    let me = gc.register_current_thread().unwrap();
    let mut roots = Roots::new(&gc, 2);

    let outside = Box::new(0u64);
    let addr = std::ptr::from_ref(&*outside) as usize;
    roots.set(0, addr);
    me.alloc(64).unwrap();
    assert!(me.collect());
    assert!(!gc.is_black_listed(addr));
    assert_eq!(gc.stats().bytes_in_use, 0);
}
