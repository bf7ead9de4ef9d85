//! Allocation failure once the heap cap is reached.

mod common;

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use consgc::{Collector, GcConfig, GcError};

use common::Roots;

const CAP: usize = 256 * 1024;
const CHUNK: usize = 64 * 1024;

fn capped() -> GcConfig {
    common::config()
        .with_scan_stacks(false)
        .with_max_heap_size(Some(CAP))
}

#[test]
fn test_capped_heap_reports_out_of_memory() {
    let gc = Collector::new(capped()).unwrap();
    let me = gc.register_current_thread().unwrap();
    let mut roots = Roots::new(&gc, 8);

    let mut placed = 0;
    let err = loop {
        match me.alloc(CHUNK) {
            Ok(obj) => {
                roots.set_ptr(placed, obj);
                placed += 1;
            }
            Err(err) => break err,
        }
        assert!(placed < 8, "heap cap was not enforced");
    };
    assert!(matches!(err, GcError::OutOfMemory { requested: CHUNK }));
    assert!((3..=4).contains(&placed), "{placed} chunks fit");
    assert_eq!(gc.stats().heap_size, CAP);
    assert!(gc.gc_count() >= 1);

    // Dropping one root frees room for the retry.
    roots.set(0, 0);
    let again = me.alloc(CHUNK).unwrap();
    roots.set_ptr(0, again);
}

#[test]
fn test_expand_heap_respects_cap() {
    let gc = Collector::new(capped()).unwrap();
    assert!(matches!(
        gc.expand_heap(CHUNK),
        Err(GcError::OutOfMemory { .. })
    ));

    let gc = Collector::new(common::config()).unwrap();
    let before = gc.stats().heap_size;
    let added = gc.expand_heap(CHUNK).unwrap();
    assert!(added >= CHUNK);
    assert_eq!(gc.stats().heap_size, before + added);
}

#[test]
fn test_oom_handler_can_salvage_allocation() {
    let salvage: &'static mut [u8] = Box::leak(vec![0u8; CHUNK].into_boxed_slice());
    let salvage_addr = salvage.as_mut_ptr() as usize;
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);

    let gc = Collector::new(capped().with_oom_handler(move |bytes| {
        assert_eq!(bytes, CHUNK);
        seen.fetch_add(1, Ordering::Relaxed);
        NonNull::new(salvage_addr as *mut u8)
    }))
    .unwrap();
    let me = gc.register_current_thread().unwrap();
    let mut roots = Roots::new(&gc, 8);

    let mut salvaged = None;
    for slot in 0..8 {
        let obj = me.alloc(CHUNK).unwrap();
        if obj.as_ptr() as usize == salvage_addr {
            salvaged = Some(slot);
            break;
        }
        roots.set_ptr(slot, obj);
    }
    assert!(salvaged.is_some());
    assert_eq!(calls.load(Ordering::Relaxed), 1);

    gc.set_oom_handler(None);
    assert!(me.alloc(CHUNK).is_err());
    assert_eq!(calls.load(Ordering::Relaxed), 1);
}

#[test]
fn test_huge_requests_are_out_of_memory() {
    let gc = Collector::new(common::config().with_scan_stacks(false)).unwrap();
    let me = gc.register_current_thread().unwrap();
    let heap_size = gc.stats().heap_size;

    for bytes in [usize::MAX, usize::MAX - 100, isize::MAX as usize, usize::MAX / 4] {
        assert!(
            matches!(me.alloc(bytes), Err(GcError::OutOfMemory { requested }) if requested == bytes),
            "{bytes:#x} did not fail cleanly"
        );
        assert!(matches!(
            me.alloc_atomic(bytes),
            Err(GcError::OutOfMemory { .. })
        ));
    }
    assert_eq!(gc.stats().heap_size, heap_size);
    assert!(gc.is_heap_ptr(me.alloc(64).unwrap().as_ptr()));
}

#[test]
fn test_request_above_cap_fails_without_collecting() {
    let gc = Collector::new(capped()).unwrap();
    let me = gc.register_current_thread().unwrap();
    assert!(matches!(
        me.alloc(CAP + 1),
        Err(GcError::OutOfMemory { requested }) if requested == CAP + 1
    ));
    assert_eq!(gc.gc_count(), 0);
}
