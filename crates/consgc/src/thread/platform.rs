//! The seam between the collector and the host's threading.
//!
//! A [`PlatformThreadControl`] knows how to stop a registered thread, read
//! back where its stack and registers were at that point, and let it run
//! again. [`CooperativeThreadControl`] implements it with safepoints: a
//! thread asked to stop parks the next time it allocates or calls
//! `safepoint`, and threads inside `do_blocking` count as stopped.

use std::fmt;

use super::registry::ThreadRecord;

/// How a thread ended up once a stop was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendState {
    /// Stopped at the collector's request.
    Suspended,
    /// Was inside a blocking section; its frozen stack is scanned as is.
    Blocked,
    /// Unregistered before it could be stopped. Contributes no roots.
    Exited,
}

/// Stack range and register values of a stopped thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedContext {
    pub stack_pointer: usize,
    pub stack_base: usize,
    pub registers: Vec<usize>,
}

impl CapturedContext {
    /// The live part of the stack, `[stack_pointer, stack_base)`.
    #[must_use]
    pub fn stack_range(&self) -> std::ops::Range<usize> {
        if self.stack_pointer < self.stack_base {
            self.stack_pointer..self.stack_base
        } else {
            0..0
        }
    }
}

/// A thread-control operation failed. The collector treats this as fatal.
#[derive(Debug)]
pub struct PlatformError {
    pub operation: &'static str,
    pub detail: String,
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.operation, self.detail)
    }
}

impl std::error::Error for PlatformError {}

/// Thread suspension and context capture.
pub trait PlatformThreadControl: Send + Sync {
    /// Asks `thread` to stop. May return before it has.
    ///
    /// # Errors
    ///
    /// Any failure aborts the collection process.
    fn suspend_thread(&self, thread: &ThreadRecord) -> Result<(), PlatformError>;

    /// Blocks until `thread` is stopped, blocked or gone.
    ///
    /// # Errors
    ///
    /// As for [`suspend_thread`](Self::suspend_thread).
    fn wait_until_suspended(&self, thread: &ThreadRecord) -> Result<SuspendState, PlatformError>;

    /// Lets a thread stopped by [`suspend_thread`](Self::suspend_thread)
    /// continue.
    ///
    /// # Errors
    ///
    /// As for [`suspend_thread`](Self::suspend_thread).
    fn resume_thread(&self, thread: &ThreadRecord) -> Result<(), PlatformError>;

    /// Stack range and registers of a stopped or blocked thread.
    fn capture_stack_and_registers(&self, thread: &ThreadRecord) -> Option<CapturedContext>;

    /// Stack base of the calling thread, if it can be determined.
    fn current_stack_base(&self) -> Option<usize>;

    /// Called by a registered thread at allocation and explicit safepoints.
    fn safepoint(&self, thread: &ThreadRecord) {
        let _ = thread;
    }
}

/// Safepoint-based suspension. The default platform.
#[derive(Debug, Default, Clone, Copy)]
pub struct CooperativeThreadControl;

impl PlatformThreadControl for CooperativeThreadControl {
    fn suspend_thread(&self, thread: &ThreadRecord) -> Result<(), PlatformError> {
        thread.request_suspend();
        Ok(())
    }

    fn wait_until_suspended(&self, thread: &ThreadRecord) -> Result<SuspendState, PlatformError> {
        Ok(thread.wait_for_stop())
    }

    fn resume_thread(&self, thread: &ThreadRecord) -> Result<(), PlatformError> {
        thread.release();
        Ok(())
    }

    fn capture_stack_and_registers(&self, thread: &ThreadRecord) -> Option<CapturedContext> {
        thread.recorded_context()
    }

    fn current_stack_base(&self) -> Option<usize> {
        crate::stack::current_stack_base()
    }

    #[inline]
    fn safepoint(&self, thread: &ThreadRecord) {
        thread.park_if_requested();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverted_stack_range_is_empty() {
        let ctx = CapturedContext {
            stack_pointer: 0x2000,
            stack_base: 0x1000,
            registers: Vec::new(),
        };
        assert!(ctx.stack_range().is_empty());
        let ctx = CapturedContext {
            stack_pointer: 0x1000,
            stack_base: 0x2000,
            registers: vec![1],
        };
        assert_eq!(ctx.stack_range(), 0x1000..0x2000);
    }
}
