//! # Mmap Backend
//!
//! Reserves inaccessible anonymous mappings and flips page protection as
//! pages are committed. Decommitted pages are handed back to the kernel
//! with `MADV_DONTNEED` and read as zero when committed again.

// SAFETY: All libc calls operate on spans inside mappings created by
// `reserve`; the page map guarantees page-aligned arguments.
#![allow(unsafe_code)]

use std::io;
use std::ptr;

use libc::{
    c_void, madvise, mmap, mprotect, munmap, sysconf, MADV_DONTNEED, MAP_ANONYMOUS, MAP_FAILED,
    MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE, _SC_PAGESIZE,
};

use super::heap::DEFAULT_PAGE_SIZE;
use super::PageBackend;
use crate::error::{MemoryError, MemoryResult};

/// Page backend built on `mmap`, `mprotect` and `madvise`.
#[derive(Clone, Copy, Debug)]
pub struct MmapBackend {
    page_size: usize,
}

impl MmapBackend {
    /// Mmap backend using the system page size.
    #[must_use]
    pub fn new() -> Self {
        // SAFETY: sysconf has no preconditions.
        let page_size = unsafe { sysconf(_SC_PAGESIZE) };
        let page_size = usize::try_from(page_size)
            .ok()
            .filter(|size| size.is_power_of_two())
            .unwrap_or(DEFAULT_PAGE_SIZE);
        Self { page_size }
    }

    fn failure(base: usize, size: usize) -> MemoryError {
        MemoryError::PlatformCommit {
            base,
            size,
            reason: io::Error::last_os_error().to_string(),
        }
    }
}

impl Default for MmapBackend {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: reservations are fresh private anonymous mappings; committed
// pages are readable and writable and decommitted pages come back zeroed.
unsafe impl PageBackend for MmapBackend {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn reserve(&self, size: usize) -> MemoryResult<usize> {
        if size == 0 {
            return Err(MemoryError::InvalidSize(size));
        }
        // SAFETY: anonymous private mapping with no address hint.
        let base = unsafe {
            mmap(
                ptr::null_mut(),
                size,
                PROT_NONE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == MAP_FAILED {
            return Err(MemoryError::PlatformReservation {
                size,
                reason: io::Error::last_os_error().to_string(),
            });
        }
        Ok(base as usize)
    }

    unsafe fn commit(&self, base: usize, size: usize) -> MemoryResult<()> {
        // SAFETY: the caller guarantees the span lies inside a reservation
        // made by `reserve`.
        let rc = unsafe { mprotect(base as *mut c_void, size, PROT_READ | PROT_WRITE) };
        if rc != 0 {
            return Err(Self::failure(base, size));
        }
        Ok(())
    }

    unsafe fn decommit(&self, base: usize, size: usize) -> MemoryResult<()> {
        // SAFETY: the caller guarantees the span lies inside a reservation
        // made by `reserve`.
        unsafe {
            if madvise(base as *mut c_void, size, MADV_DONTNEED) != 0 {
                return Err(Self::failure(base, size));
            }
            if mprotect(base as *mut c_void, size, PROT_NONE) != 0 {
                return Err(Self::failure(base, size));
            }
        }
        Ok(())
    }

    unsafe fn release(&self, base: usize, size: usize) -> MemoryResult<()> {
        // SAFETY: the caller guarantees `base` and `size` describe a whole
        // mapping from `reserve`.
        let rc = unsafe { munmap(base as *mut c_void, size) };
        if rc != 0 {
            return Err(Self::failure(base, size));
        }
        Ok(())
    }
}
