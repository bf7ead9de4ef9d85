use std::io::{self, Error};
use std::mem;
use std::ptr;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

fn system_info() -> SYSTEM_INFO {
    // SAFETY: GetSystemInfo fills the struct and cannot fail.
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        info
    }
}

/// `VirtualAlloc` addresses are aligned to this value (typically 64KB).
pub fn allocation_granularity() -> usize {
    match system_info().dwAllocationGranularity as usize {
        0 => 65536,
        gran => gran,
    }
}

pub fn page_size() -> usize {
    match system_info().dwPageSize as usize {
        0 => 4096,
        size => size,
    }
}

pub struct MmapInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl MmapInner {
    /// Reserves and commits `len` bytes, trying `hint_addr` first.
    ///
    /// # Safety
    ///
    /// Calls `VirtualAlloc`; the hint is only a request.
    pub unsafe fn map_anon(
        hint_addr: usize,
        len: usize,
        _populate: bool,
        _no_reserve: bool,
    ) -> io::Result<Self> {
        let addr = if hint_addr == 0 {
            ptr::null()
        } else {
            hint_addr as *const std::ffi::c_void
        };

        // SAFETY: plain reservation; no existing memory is touched.
        let mut ptr = unsafe { VirtualAlloc(addr, len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
        if ptr.is_null() && !addr.is_null() {
            // SAFETY: as above, without the hint.
            ptr = unsafe { VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
        }
        if ptr.is_null() {
            return Err(Error::last_os_error());
        }

        Ok(Self { ptr, len })
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

/// Decommits the pages of a range while keeping it reserved.
///
/// # Safety
///
/// `addr..addr + len` must be page aligned and inside a live mapping that
/// nothing reads until [`recommit`] is called.
pub unsafe fn decommit(addr: *mut u8, len: usize) -> io::Result<()> {
    // SAFETY: the caller owns the range.
    if unsafe { VirtualFree(addr.cast(), len, MEM_DECOMMIT) } == 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Commits a previously decommitted range. Pages read as zero.
///
/// # Safety
///
/// `addr..addr + len` must be page aligned and inside a live mapping.
pub unsafe fn recommit(addr: *mut u8, len: usize) -> io::Result<()> {
    // SAFETY: the range is reserved by the caller's mapping.
    let ptr = unsafe { VirtualAlloc(addr.cast(), len, MEM_COMMIT, PAGE_READWRITE) };
    if ptr.is_null() {
        return Err(Error::last_os_error());
    }
    Ok(())
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            // SAFETY: MEM_RELEASE requires size 0 and the original base.
            unsafe {
                VirtualFree(self.ptr, 0, MEM_RELEASE);
            }
        }
    }
}
