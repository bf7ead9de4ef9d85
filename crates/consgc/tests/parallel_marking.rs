//! Parallel marking must mark exactly what sequential marking marks.

mod common;

use std::collections::VecDeque;
use std::ptr::NonNull;

use consgc::Collector;

use common::Roots;

const NODES: usize = 4000;
const NODE_BYTES: usize = 32;

/// Out-edges of node `i`. Nodes numbered 4 mod 5 are never targets.
fn edges(i: usize) -> [Option<usize>; 3] {
    [(i * 7 + 1), (i * 13 + 5), (i * 31 + 11)].map(|t| {
        let t = t % NODES;
        (t % 5 != 4).then_some(t)
    })
}

fn expected_reachable() -> Vec<bool> {
    let mut seen = vec![false; NODES];
    let mut queue = VecDeque::from([0]);
    seen[0] = true;
    while let Some(i) = queue.pop_front() {
        for t in edges(i).into_iter().flatten() {
            if !seen[t] {
                seen[t] = true;
                queue.push_back(t);
            }
        }
    }
    seen
}

/// Builds the graph with collection disabled and roots node 0.
fn marked_after_collect(markers: usize) -> Vec<bool> {
    let gc = Collector::new(common::config().with_markers(markers).with_scan_stacks(false)).unwrap();
    assert_eq!(gc.helper_markers(), markers - 1);
    let me = gc.register_current_thread().unwrap();
    let mut roots = Roots::new(&gc, 1);

    gc.disable();
    let nodes: Vec<NonNull<u8>> = (0..NODES).map(|_| me.alloc(NODE_BYTES).unwrap()).collect();
    for (i, &node) in nodes.iter().enumerate() {
        for (word, target) in edges(i).into_iter().enumerate() {
            let value = target.map_or(0, |t| nodes[t].as_ptr() as usize);
            unsafe { common::store(node, word, value) };
        }
        unsafe { common::store(node, 3, i) };
    }
    roots.set_ptr(0, nodes[0]);
    gc.enable();

    assert!(me.collect());
    assert_eq!(gc.metrics().last().markers, markers);
    nodes.iter().map(|n| gc.is_marked(n.as_ptr())).collect()
}

#[test]
fn test_sequential_marking_matches_reachability() {
    assert_eq!(marked_after_collect(1), expected_reachable());
}

#[test]
fn test_parallel_marking_matches_sequential() {
    let expected = expected_reachable();
    assert!(expected.iter().filter(|&&r| r).count() > NODES / 2);
    for markers in [2, 4] {
        assert_eq!(marked_after_collect(markers), expected, "{markers} markers");
    }
}

#[test]
fn test_parallel_marking_of_long_chain() {
    let gc = Collector::new(common::config().with_markers(4).with_scan_stacks(false)).unwrap();
    let me = gc.register_current_thread().unwrap();
    let mut roots = Roots::new(&gc, 1);

    gc.disable();
    let head = common::build_chain(&me, 30_000, 32);
    roots.set_ptr(0, head);
    gc.enable();

    for _ in 0..2 {
        assert!(me.collect());
        assert_eq!(common::walk_chain(roots.get(0).unwrap()), 30_000);
    }
    assert_eq!(gc.metrics().last().objects_surviving, 30_000);
}
