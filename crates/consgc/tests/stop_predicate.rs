//! Abandoning collections through the stop predicate.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use consgc::Collector;

#[test]
fn test_stop_predicate_aborts_collection() {
    let gc = Collector::new(common::config()).unwrap();
    let me = gc.register_current_thread().unwrap();
    let head = std::hint::black_box(common::build_chain(&me, 2000, 32));
    let before = gc.stats();

    gc.set_stop_predicate(|| true);
    assert!(!me.collect());

    let metrics = gc.metrics();
    assert_eq!(metrics.total_aborted(), 1);
    assert_eq!(metrics.total_collections(), 0);
    assert!(metrics.last().aborted);
    assert_eq!(gc.gc_count(), 0);
    assert_eq!(gc.stats().bytes_in_use, before.bytes_in_use);
    assert_eq!(common::walk_chain(head), 2000);
    assert!(gc.check_heap().is_ok());

    gc.clear_stop_predicate();
    assert!(me.collect());
    assert_eq!(gc.gc_count(), 1);
    assert_eq!(common::walk_chain(head), 2000);
    std::hint::black_box(head);
}

#[test]
fn test_stop_predicate_is_polled() {
    let gc = Collector::new(common::config().with_markers(2)).unwrap();
    let me = gc.register_current_thread().unwrap();
    let head = std::hint::black_box(common::build_chain(&me, 5000, 32));

    let polls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&polls);
    gc.set_stop_predicate(move || {
        counter.fetch_add(1, Ordering::Relaxed);
        false
    });
    assert!(me.collect());
    assert!(polls.load(Ordering::Relaxed) >= 1);
    assert_eq!(gc.metrics().total_aborted(), 0);
    assert_eq!(common::walk_chain(head), 5000);
    std::hint::black_box(head);
}

#[test]
fn test_allocation_continues_when_collections_abort() {
    let gc = Collector::new(common::config()).unwrap();
    let me = gc.register_current_thread().unwrap();
    gc.set_stop_predicate(|| true);

    for _ in 0..(2 * 1024 * 1024 / 64) {
        me.alloc(64).unwrap();
    }
    assert_eq!(gc.gc_count(), 0);
    assert!(gc.stats().heap_size > 256 * 1024);
}
