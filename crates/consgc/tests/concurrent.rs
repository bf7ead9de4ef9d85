//! Several mutator threads allocating and collecting at once.

mod common;

use std::ptr::NonNull;
use std::sync::{Arc, Barrier};
use std::thread;

use consgc::{Collector, ThreadHandle};

const THREADS: usize = 4;
const ITERATIONS: usize = 3000;
const KEPT: usize = 32;

fn tag(thread: usize, i: usize) -> usize {
    thread * 1_000_000 + i
}

#[inline(never)]
fn mutate(me: &ThreadHandle, thread: usize) {
    let mut kept = [0usize; KEPT];
    let mut tags = [0usize; KEPT];
    for i in 0..ITERATIONS {
        let bytes = 16 * (1 + i % 16);
        let obj = me.alloc(bytes).unwrap();
        unsafe {
            common::store(obj, 0, tag(thread, i));
            common::store(obj, 1, !tag(thread, i));
        }
        let slot = i % KEPT;
        kept[slot] = obj.as_ptr() as usize;
        tags[slot] = tag(thread, i);

        if i % 11 == 0 {
            let scratch = me.alloc_uncollectable(48).unwrap();
            unsafe { me.free(scratch) };
        }
        if i % 500 == 0 {
            me.collect();
        }
        if i % 64 == 0 {
            me.safepoint();
        }
    }

    std::hint::black_box(&kept);
    for (slot, &addr) in kept.iter().enumerate() {
        let obj = NonNull::new(addr as *mut u8).unwrap();
        let expected = tags[slot];
        assert_eq!(unsafe { common::load(obj, 0) }, expected);
        assert_eq!(unsafe { common::load(obj, 1) }, !expected);
    }
}

#[test]
fn test_threads_allocate_and_collect_concurrently() {
    let gc = Collector::new(common::config().with_markers(3)).unwrap();
    assert_eq!(gc.helper_markers(), 2);
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let gc = gc.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                // Wait for everyone before registering so no registered
                // thread ever blocks on the barrier.
                barrier.wait();
                let me = gc.register_current_thread().unwrap();
                mutate(&me, t);
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(gc.live_threads(), 0);
    assert!(gc.gc_count() >= 1);
    assert!(gc.check_heap().is_ok());
    assert!(gc.collect());
}

#[test]
fn test_blocked_main_thread_with_busy_workers() {
    let gc = Collector::new(common::config().with_markers(2)).unwrap();
    let me = gc.register_current_thread().unwrap();
    let head = std::hint::black_box(common::build_chain(&me, 200, 32));

    let workers: Vec<_> = (0..2)
        .map(|t| {
            let gc = gc.clone();
            thread::spawn(move || {
                let me = gc.register_current_thread().unwrap();
                mutate(&me, t + 10);
            })
        })
        .collect();
    me.do_blocking(|| {
        for worker in workers {
            worker.join().unwrap();
        }
    });

    assert!(gc.gc_count() >= 1);
    assert_eq!(common::walk_chain(head), 200);
    std::hint::black_box(head);
}
