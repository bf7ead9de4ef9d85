//! Anonymous virtual memory for the collector's heap.
//!
//! The collector reserves its heap in large chunks and hands out fixed-size
//! blocks from them. This crate owns the OS side of that: mapping anonymous
//! read/write memory, giving physical pages back while keeping the address
//! range reserved (`decommit`), and making such a range usable again
//! (`recommit`).

use std::io;
use std::ops::Range;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows this is typically 64KB. On Unix it is the page size.
/// Hint addresses should be aligned to this value.
#[must_use]
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// A mapped region of anonymous memory.
///
/// The region is unmapped when this handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Pointer to the first byte of the mapping.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Length of the mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping has zero length.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Address range of the mapping.
    #[must_use]
    pub fn range(&self) -> Range<usize> {
        let start = self.ptr() as usize;
        start..start + self.len()
    }

    /// Largest sub-range whose start is aligned to `align` and whose length
    /// is a multiple of `align`.
    ///
    /// Returns an empty range if the mapping cannot hold a single aligned
    /// unit. `align` must be a power of two.
    #[must_use]
    pub fn aligned_range(&self, align: usize) -> Range<usize> {
        debug_assert!(align.is_power_of_two());
        let Range { start, end } = self.range();
        let aligned_start = (start + align - 1) & !(align - 1);
        if aligned_start >= end {
            return aligned_start..aligned_start;
        }
        let usable = (end - aligned_start) & !(align - 1);
        aligned_start..aligned_start + usable
    }

    /// Returns the physical pages backing `[addr, addr + len)` to the OS.
    ///
    /// The range stays reserved. Its contents read as zero after a later
    /// [`Mmap::recommit`].
    ///
    /// # Errors
    ///
    /// Fails if the range is not page aligned, lies outside this mapping, or
    /// the OS call fails.
    pub fn decommit(&self, addr: usize, len: usize) -> io::Result<()> {
        self.check_subrange(addr, len)?;
        // SAFETY: the range is page aligned and inside this mapping.
        unsafe { os::decommit(addr as *mut u8, len) }
    }

    /// Makes a previously decommitted range readable and writable again.
    ///
    /// # Errors
    ///
    /// Fails if the range is not page aligned, lies outside this mapping, or
    /// the OS call fails.
    pub fn recommit(&self, addr: usize, len: usize) -> io::Result<()> {
        self.check_subrange(addr, len)?;
        // SAFETY: the range is page aligned and inside this mapping.
        unsafe { os::recommit(addr as *mut u8, len) }
    }

    fn check_subrange(&self, addr: usize, len: usize) -> io::Result<()> {
        let page = page_size();
        let range = self.range();
        let end = addr.checked_add(len);
        let inside = matches!(end, Some(end) if addr >= range.start && end <= range.end);
        if !inside || addr % page != 0 || len % page != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("range {addr:#x}+{len:#x} is not a page aligned part of the mapping"),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Mmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mmap")
            .field("ptr", &self.ptr())
            .field("len", &self.len())
            .finish()
    }
}

// SAFETY: the mapping is plain memory owned by this handle.
unsafe impl Send for Mmap {}
// SAFETY: the handle itself is immutable; callers synchronize access to the memory.
unsafe impl Sync for Mmap {}

/// Configuration for creating a memory mapping.
#[derive(Debug, Clone, Default)]
pub struct MmapOptions {
    len: usize,
    hint_addr: usize,
    populate: bool,
    no_reserve: bool,
}

impl MmapOptions {
    /// Creates options with length 0. A length must be set before mapping.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            len: 0,
            hint_addr: 0,
            populate: false,
            no_reserve: false,
        }
    }

    /// Sets the length of the mapping in bytes.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Asks the OS to place the mapping at `addr`. The OS may ignore it.
    #[must_use]
    pub const fn with_hint(mut self, addr: usize) -> Self {
        self.hint_addr = addr;
        self
    }

    /// Prefault the page tables (`MAP_POPULATE` on Linux).
    #[must_use]
    pub const fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Skip swap reservation (`MAP_NORESERVE` where supported).
    #[must_use]
    pub const fn no_reserve(mut self, no_reserve: bool) -> Self {
        self.no_reserve = no_reserve;
        self
    }

    /// Creates an anonymous read/write mapping.
    ///
    /// # Errors
    ///
    /// Fails if the length is zero or the OS refuses the mapping.
    ///
    /// # Safety
    ///
    /// A hint address must not overlap memory the caller relies on; on some
    /// platforms a hinted mapping can replace an existing one.
    pub unsafe fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }

        // SAFETY: forwarded from the caller.
        let inner = unsafe {
            os::MmapInner::map_anon(self.hint_addr, self.len, self.populate, self.no_reserve)?
        };

        Ok(Mmap { inner })
    }
}
