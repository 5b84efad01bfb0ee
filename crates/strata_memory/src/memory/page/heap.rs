//! # Heap Backend
//!
//! Portable backend on top of the global allocator. The whole reservation
//! is allocated zeroed up front; commit and decommit only affect the page
//! bookkeeping (decommit re-zeroes so that recommitted pages read as zero,
//! as they would after a real decommit).

// SAFETY: Reservations are obtained from and returned to the global
// allocator with the exact layout they were created with.
#![allow(unsafe_code)]

use std::alloc::{self, Layout};

use super::PageBackend;
use crate::error::{MemoryError, MemoryResult};
use crate::memory::range::Range;
use crate::memory::raw;

/// Page size used when none is given.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Page backend that reserves memory from the global allocator.
#[derive(Clone, Copy, Debug)]
pub struct HeapBackend {
    page_size: usize,
}

impl HeapBackend {
    /// Heap backend with 4 KiB pages.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Heap backend with a custom page size.
    ///
    /// # Panics
    ///
    /// Panics if `page_size` is not a power of two.
    #[must_use]
    pub fn with_page_size(page_size: usize) -> Self {
        assert!(page_size.is_power_of_two(), "Page size must be a power of two");
        Self { page_size }
    }

    fn layout(&self, size: usize) -> MemoryResult<Layout> {
        Layout::from_size_align(size, self.page_size).map_err(|err| MemoryError::PlatformReservation {
            size,
            reason: err.to_string(),
        })
    }
}

impl Default for HeapBackend {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: reservations are zeroed, page-aligned heap blocks owned by the
// caller until released, and decommit re-zeroes.
unsafe impl PageBackend for HeapBackend {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn reserve(&self, size: usize) -> MemoryResult<usize> {
        if size == 0 {
            return Err(MemoryError::InvalidSize(size));
        }
        let layout = self.layout(size)?;
        // SAFETY: layout has non-zero size.
        let base = unsafe { alloc::alloc_zeroed(layout) };
        if base.is_null() {
            return Err(MemoryError::PlatformReservation {
                size,
                reason: "global allocator returned null".to_owned(),
            });
        }
        Ok(base as usize)
    }

    unsafe fn commit(&self, _base: usize, _size: usize) -> MemoryResult<()> {
        Ok(())
    }

    unsafe fn decommit(&self, base: usize, size: usize) -> MemoryResult<()> {
        // SAFETY: the caller guarantees the span lies inside a live
        // reservation of this backend.
        unsafe { raw::zero(Range::with_size(base, size)) };
        Ok(())
    }

    unsafe fn release(&self, base: usize, size: usize) -> MemoryResult<()> {
        let layout = self.layout(size)?;
        // SAFETY: the caller guarantees `base` came from `reserve` with the
        // same size, so the layout matches.
        unsafe { alloc::dealloc(base as *mut u8, layout) };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_is_page_aligned_and_zeroed() {
        let backend = HeapBackend::with_page_size(256);
        let base = backend.reserve(1024).unwrap();
        assert_eq!(base % 256, 0);

        let range = Range::with_size(base, 1024);
        let word: u64 = unsafe { raw::read(range) };
        assert_eq!(word, 0);

        unsafe { raw::write(range, &[7; 8]) };
        unsafe { backend.decommit(base, 256) }.unwrap();
        let word: u64 = unsafe { raw::read(range) };
        assert_eq!(word, 0);

        unsafe { backend.release(base, 1024) }.unwrap();
    }

    #[test]
    fn test_zero_reservation_is_refused() {
        assert_eq!(HeapBackend::new().reserve(0), Err(MemoryError::InvalidSize(0)));
    }
}
