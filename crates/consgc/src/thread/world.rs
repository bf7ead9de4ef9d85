//! Stopping and restarting every registered thread but the collector.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::platform::{CapturedContext, PlatformThreadControl, SuspendState};
use super::registry::{ThreadRecord, ThreadRegistry, ThreadStatus};
use crate::error::fatal;

/// One thread as seen while the world is stopped.
#[derive(Debug)]
pub struct StoppedThread {
    pub record: Arc<ThreadRecord>,
    pub state: SuspendState,
    pub context: Option<CapturedContext>,
    /// A suspend was requested and must be undone on resume.
    requested: bool,
}

/// The result of [`WorldController::stop_world`]. Hand it back to
/// [`WorldController::resume_world`].
#[derive(Debug)]
#[must_use = "a stopped world must be resumed"]
pub struct StoppedWorld {
    pub threads: Vec<StoppedThread>,
    pub elapsed: Duration,
}

impl StoppedWorld {
    /// Contexts of threads that contribute roots.
    pub fn contexts(&self) -> impl Iterator<Item = &CapturedContext> + '_ {
        self.threads.iter().filter_map(|t| t.context.as_ref())
    }

    /// Threads that were suspended rather than found blocked or gone.
    #[must_use]
    pub fn suspended_count(&self) -> usize {
        self.threads
            .iter()
            .filter(|t| t.state == SuspendState::Suspended)
            .count()
    }
}

/// Drives a [`PlatformThreadControl`] over a [`ThreadRegistry`].
pub struct WorldController {
    platform: Arc<dyn PlatformThreadControl>,
}

impl WorldController {
    #[must_use]
    pub fn new(platform: Arc<dyn PlatformThreadControl>) -> Self {
        Self { platform }
    }

    #[must_use]
    pub fn platform(&self) -> &dyn PlatformThreadControl {
        &*self.platform
    }

    /// Stops every live registered thread other than `caller` and captures
    /// their contexts. New registrations wait until the world resumes.
    ///
    /// All requests go out before the first wait so threads park in
    /// parallel.
    pub fn stop_world(&self, registry: &ThreadRegistry, caller: Option<&ThreadRecord>) -> StoppedWorld {
        let began = Instant::now();
        let records = registry.begin_stop();
        let mut threads = Vec::with_capacity(records.len());
        for record in records {
            if caller.is_some_and(|c| std::ptr::eq(c, &*record)) {
                continue;
            }
            let requested = record.status() == ThreadStatus::Running;
            if requested {
                if let Err(err) = self.platform.suspend_thread(&record) {
                    fatal!("cannot suspend thread {:?}: {err}", record.id());
                }
            }
            threads.push(StoppedThread {
                record,
                state: SuspendState::Exited,
                context: None,
                requested,
            });
        }
        for thread in &mut threads {
            thread.state = match self.platform.wait_until_suspended(&thread.record) {
                Ok(state) => state,
                Err(err) => fatal!("thread {:?} did not stop: {err}", thread.record.id()),
            };
            if thread.state != SuspendState::Exited {
                thread.context = self.platform.capture_stack_and_registers(&thread.record);
            }
        }
        StoppedWorld {
            threads,
            elapsed: began.elapsed(),
        }
    }

    /// Resumes what [`stop_world`](Self::stop_world) suspended and clears
    /// the world-stopped flag.
    pub fn resume_world(&self, registry: &ThreadRegistry, world: StoppedWorld) {
        for thread in world.threads.iter().filter(|t| t.requested) {
            if let Err(err) = self.platform.resume_thread(&thread.record) {
                fatal!("cannot resume thread {:?}: {err}", thread.record.id());
            }
        }
        registry.end_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::platform::CooperativeThreadControl;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn blocked_and_parked_threads_are_both_stopped() {
        let registry = Arc::new(ThreadRegistry::new(128));
        let controller = WorldController::new(Arc::new(CooperativeThreadControl));
        let me = registry.register(0x1_0000).unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let (tx, rx) = std::sync::mpsc::channel();

        let spinner = {
            let (registry, done, tx) = (Arc::clone(&registry), Arc::clone(&done), tx.clone());
            std::thread::spawn(move || {
                let record = registry.register(0x2_0000).unwrap();
                tx.send(()).unwrap();
                while !done.load(Ordering::Acquire) {
                    record.park_if_requested();
                    std::hint::spin_loop();
                }
                registry.unregister(&record);
            })
        };
        let blocker = {
            let (registry, done) = (Arc::clone(&registry), Arc::clone(&done));
            std::thread::spawn(move || {
                let record = registry.register(0x3_0000).unwrap();
                crate::stack::with_spilled_registers(|ctx| record.enter_blocking(ctx));
                tx.send(()).unwrap();
                while !done.load(Ordering::Acquire) {
                    std::thread::yield_now();
                }
                registry.leave_blocking(&record);
                registry.unregister(&record);
            })
        };
        rx.recv().unwrap();
        rx.recv().unwrap();

        let world = controller.stop_world(&registry, Some(&me));
        assert_eq!(world.threads.len(), 2);
        assert_eq!(world.suspended_count(), 1);
        assert!(world
            .threads
            .iter()
            .any(|t| t.state == SuspendState::Blocked));
        assert_eq!(world.contexts().count(), 2);
        assert!(registry.is_world_stopped());

        done.store(true, Ordering::Release);
        controller.resume_world(&registry, world);
        spinner.join().unwrap();
        blocker.join().unwrap();
        assert!(!registry.is_world_stopped());
        assert_eq!(registry.live_threads(), 1);
    }
}
