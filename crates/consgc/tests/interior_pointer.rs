//! Interior pointers and the extra byte.

mod common;

use consgc::Collector;

use common::Roots;

#[test]
fn test_interior_pointer_keeps_object_alive() {
    let gc = Collector::new(common::config().with_scan_stacks(false)).unwrap();
    let me = gc.register_current_thread().unwrap();
    let mut roots = Roots::new(&gc, 2);

    let obj = me.alloc(48).unwrap();
    let big = me.alloc(3 * 4096).unwrap();
    roots.set(0, obj.as_ptr() as usize + 24);
    roots.set(1, big.as_ptr() as usize + 2 * 4096 + 100);

    assert!(me.collect());
    assert!(gc.is_marked(obj.as_ptr()));
    assert!(gc.is_marked(big.as_ptr()));
    assert_eq!(gc.base((obj.as_ptr() as usize + 47) as *const u8), Some(obj));
}

#[test]
fn test_interior_pointer_ignored_when_disabled() {
    let gc = Collector::new(
        common::config()
            .with_scan_stacks(false)
            .with_interior_pointers(false),
    )
    .unwrap();
    let me = gc.register_current_thread().unwrap();
    let mut roots = Roots::new(&gc, 3);

    let exact = me.alloc(48).unwrap();
    let inner = me.alloc(48).unwrap();
    let big = me.alloc(2 * 4096).unwrap();
    roots.set_ptr(0, exact);
    roots.set(1, inner.as_ptr() as usize + 16);
    roots.set(2, big.as_ptr() as usize + 4096 + 8);
    let hidden_inner = common::hide(inner);
    let big_addr = big.as_ptr() as usize;

    assert!(me.collect());
    assert!(gc.is_marked(exact.as_ptr()));
    assert!(!gc.is_marked(common::reveal(hidden_inner).as_ptr()));
    assert!(gc.is_black_listed(common::reveal(hidden_inner).as_ptr() as usize));
    assert!(!gc.is_heap_ptr(big_addr as *const u8));

    // Queries still resolve interior addresses of live objects.
    assert_eq!(gc.base((exact.as_ptr() as usize + 40) as *const u8), Some(exact));
}

#[test]
fn test_extra_byte_covers_one_past_the_end() {
    let gc = Collector::new(
        common::config()
            .with_scan_stacks(false)
            .with_extra_byte(true),
    )
    .unwrap();
    let me = gc.register_current_thread().unwrap();
    let mut roots = Roots::new(&gc, 1);

    let obj = me.alloc(32).unwrap();
    assert_eq!(gc.size(obj.as_ptr()), Some(48));
    let past_end = obj.as_ptr() as usize + 32;
    assert_eq!(gc.base(past_end as *const u8), Some(obj));

    roots.set(0, past_end);
    assert!(me.collect());
    assert!(gc.is_marked(obj.as_ptr()));
}

#[test]
fn test_without_extra_byte_past_end_is_next_object() {
    let gc = Collector::new(common::config().with_scan_stacks(false)).unwrap();
    let me = gc.register_current_thread().unwrap();

    let obj = me.alloc(32).unwrap();
    assert_eq!(gc.size(obj.as_ptr()), Some(32));
    let past_end = (obj.as_ptr() as usize + 32) as *const u8;
    assert_ne!(gc.base(past_end), Some(obj));
}
