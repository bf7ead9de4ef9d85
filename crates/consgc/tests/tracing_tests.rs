//! Integration tests for the `tracing` feature.
//!
//! Collections run under a capturing subscriber and the formatted output is
//! checked for the collection span, phase events and the stats summary.

#![cfg(feature = "tracing")]

mod common;

use std::io;
use std::sync::{Arc, Mutex};

use consgc::Collector;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture() -> (Captured, tracing::subscriber::DefaultGuard) {
    let captured = Captured::default();
    let writer = captured.clone();
    let guard = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(LevelFilter::TRACE)
        .finish()
        .set_default();
    (captured, guard)
}

#[test]
fn test_collection_emits_span_and_phase_events() {
    let (captured, _guard) = capture();
    let gc = Collector::new(common::config()).unwrap();
    let me = gc.register_current_thread().unwrap();
    me.alloc(64).unwrap();
    assert!(me.collect());

    let output = captured.text();
    assert!(output.contains("gc_collect"), "{output}");
    assert!(output.contains("trigger=\"explicit\""), "{output}");
    assert!(output.contains("world_stopped"), "{output}");
    assert!(output.contains("phase_end"), "{output}");
    assert!(output.contains("Sweep"), "{output}");
}

#[test]
fn test_print_stats_logs_summary() {
    let (captured, _guard) = capture();
    let gc = Collector::new(common::config().with_print_stats(true)).unwrap();
    let me = gc.register_current_thread().unwrap();
    assert!(me.collect());

    let output = captured.text();
    assert!(output.contains("collection 1:"), "{output}");
    assert!(output.contains("bytes reclaimed"), "{output}");
}

#[test]
fn test_aborted_collection_warns() {
    let (captured, _guard) = capture();
    let gc = Collector::new(common::config()).unwrap();
    let me = gc.register_current_thread().unwrap();
    gc.set_stop_predicate(|| true);
    assert!(!me.collect());

    let output = captured.text();
    assert!(output.contains("WARN"), "{output}");
    assert!(output.contains("aborted by stop predicate"), "{output}");
}

#[test]
fn test_heap_growth_is_logged() {
    let (captured, _guard) = capture();
    let gc = Collector::new(common::config()).unwrap();
    gc.expand_heap(64 * 1024).unwrap();
    assert!(captured.text().contains("heap_grown"));
}
