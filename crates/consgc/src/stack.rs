//! Thread stacks and callee-saved registers.
//!
//! Stacks are assumed to grow downward: the base is the highest address and
//! the live part of a stack is `[stack_pointer, base)`.

use crate::heap::WORD;

/// Bounds of a thread's stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    /// Highest address (one past the first pushed word).
    pub base: usize,
    /// Lowest usable address.
    pub limit: usize,
}

/// Stack bounds of the calling thread, if the platform reports them.
#[cfg(target_os = "linux")]
#[must_use]
pub fn current_stack_bounds() -> Option<StackBounds> {
    use libc::{
        pthread_attr_destroy, pthread_attr_getstack, pthread_attr_t, pthread_getattr_np,
        pthread_self,
    };

    // SAFETY: `attr` is initialized by pthread_getattr_np before use and
    // destroyed on every path after it.
    unsafe {
        let mut attr: pthread_attr_t = std::mem::zeroed();
        if pthread_getattr_np(pthread_self(), &raw mut attr) != 0 {
            return None;
        }
        let mut addr: *mut libc::c_void = std::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let ret = pthread_attr_getstack(&raw const attr, &raw mut addr, &raw mut size);
        pthread_attr_destroy(&raw mut attr);
        if ret != 0 {
            return None;
        }
        Some(StackBounds {
            base: addr as usize + size,
            limit: addr as usize,
        })
    }
}

/// Stack bounds of the calling thread, if the platform reports them.
#[cfg(target_vendor = "apple")]
#[must_use]
pub fn current_stack_bounds() -> Option<StackBounds> {
    // SAFETY: both calls only read attributes of the calling thread.
    unsafe {
        let this = libc::pthread_self();
        let base = libc::pthread_get_stackaddr_np(this) as usize;
        let size = libc::pthread_get_stacksize_np(this);
        (base != 0).then_some(StackBounds {
            base,
            limit: base - size,
        })
    }
}

/// Stack bounds of the calling thread, if the platform reports them.
#[cfg(windows)]
#[must_use]
pub fn current_stack_bounds() -> Option<StackBounds> {
    use windows_sys::Win32::System::Threading::GetCurrentThreadStackLimits;

    let mut low = 0usize;
    let mut high = 0usize;
    // SAFETY: both out-pointers are valid locals.
    unsafe { GetCurrentThreadStackLimits(&raw mut low, &raw mut high) };
    (high != 0).then_some(StackBounds {
        base: high,
        limit: low,
    })
}

/// Stack bounds of the calling thread, if the platform reports them.
#[cfg(not(any(target_os = "linux", target_vendor = "apple", windows)))]
#[must_use]
pub fn current_stack_bounds() -> Option<StackBounds> {
    None
}

/// Base of the calling thread's stack.
#[must_use]
pub fn current_stack_base() -> Option<usize> {
    current_stack_bounds().map(|b| b.base)
}

#[cfg(target_arch = "x86_64")]
pub const SPILL_WORDS: usize = 6;
#[cfg(target_arch = "aarch64")]
pub const SPILL_WORDS: usize = 11;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub const SPILL_WORDS: usize = 0;

/// Callee-saved registers and the approximate stack pointer of a thread at
/// the point it stopped.
#[derive(Debug, Clone, Copy)]
pub struct SpilledContext {
    pub stack_pointer: usize,
    pub registers: [usize; SPILL_WORDS],
}

#[inline(always)]
fn spill(regs: &mut [usize; SPILL_WORDS]) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: reads registers into outputs; no memory or flags touched.
    unsafe {
        std::arch::asm!(
            "mov {0}, rbx",
            "mov {1}, rbp",
            "mov {2}, r12",
            "mov {3}, r13",
            "mov {4}, r14",
            "mov {5}, r15",
            out(reg) regs[0],
            out(reg) regs[1],
            out(reg) regs[2],
            out(reg) regs[3],
            out(reg) regs[4],
            out(reg) regs[5],
            options(nomem, nostack, preserves_flags),
        );
    }
    #[cfg(target_arch = "aarch64")]
    // SAFETY: as above.
    unsafe {
        std::arch::asm!(
            "mov {0}, x19",
            "mov {1}, x20",
            "mov {2}, x21",
            "mov {3}, x22",
            "mov {4}, x23",
            "mov {5}, x24",
            "mov {6}, x25",
            "mov {7}, x26",
            "mov {8}, x27",
            "mov {9}, x28",
            "mov {10}, x29",
            out(reg) regs[0],
            out(reg) regs[1],
            out(reg) regs[2],
            out(reg) regs[3],
            out(reg) regs[4],
            out(reg) regs[5],
            out(reg) regs[6],
            out(reg) regs[7],
            out(reg) regs[8],
            out(reg) regs[9],
            out(reg) regs[10],
            options(nomem, nostack, preserves_flags),
        );
    }
    std::hint::black_box(regs);
}

/// Spills callee-saved registers, then runs `f` with them and the current
/// stack pointer. Everything in the caller's frames above the returned
/// stack pointer stays untouched while `f` runs.
#[inline(never)]
pub fn with_spilled_registers<R>(f: impl FnOnce(&SpilledContext) -> R) -> R {
    let mut regs = [0usize; SPILL_WORDS];
    spill(&mut regs);
    let marker = 0usize;
    let here = std::ptr::addr_of!(marker) as usize;
    let spilled = std::ptr::addr_of!(regs) as usize;
    let ctx = SpilledContext {
        stack_pointer: here.min(spilled) & !(WORD - 1),
        registers: regs,
    };
    let result = f(std::hint::black_box(&ctx));
    std::hint::black_box(&regs);
    result
}

/// Zeroes callee-saved registers that may still hold a stale pointer.
#[cfg(any(test, feature = "test-util"))]
#[inline(never)]
pub fn clear_registers() {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: the clobbered registers are declared as outputs.
    unsafe {
        std::arch::asm!(
            "xor r12, r12",
            "xor r13, r13",
            "xor r14, r14",
            "xor r15, r15",
            out("r12") _,
            out("r13") _,
            out("r14") _,
            out("r15") _,
        );
    }
    #[cfg(target_arch = "aarch64")]
    // SAFETY: as above.
    unsafe {
        std::arch::asm!(
            "mov x20, xzr",
            "mov x21, xzr",
            "mov x22, xzr",
            "mov x23, xzr",
            out("x20") _,
            out("x21") _,
            out("x22") _,
            out("x23") _,
        );
    }
}

/// Overwrites `bytes` of dead stack below the caller's frame so stale
/// pointers left by earlier calls stop looking like roots.
#[cfg(any(test, feature = "test-util"))]
#[inline(never)]
pub fn clear_stack(bytes: usize) {
    const CHUNK: usize = 1024;
    let mut scratch = [0usize; CHUNK / WORD];
    std::hint::black_box(&mut scratch);
    if bytes > CHUNK {
        clear_stack(bytes - CHUNK);
    }
    std::hint::black_box(&scratch);
}
