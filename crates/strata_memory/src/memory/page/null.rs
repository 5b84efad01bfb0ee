//! Backend for regions that never touch real memory.

// SAFETY: Nothing is ever committed, so no span of this backend is read or
// written.
#![allow(unsafe_code)]

use super::PageBackend;
use crate::error::MemoryResult;

/// Page backend that performs no platform calls.
///
/// Reservations start at address zero, so spans handed out under it are
/// pure bookkeeping and must never be dereferenced.
#[derive(Clone, Copy, Debug)]
pub(crate) struct NullBackend {
    page_size: usize,
}

impl NullBackend {
    /// Null backend reporting the given page size.
    #[cfg(test)]
    pub fn with_page_size(page_size: usize) -> Self {
        Self { page_size }
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self { page_size: 1 }
    }
}

// SAFETY: null reservations only back virtual or test page maps, which
// never dereference their spans.
unsafe impl PageBackend for NullBackend {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn reserve(&self, _size: usize) -> MemoryResult<usize> {
        Ok(0)
    }

    unsafe fn commit(&self, _base: usize, _size: usize) -> MemoryResult<()> {
        Ok(())
    }

    unsafe fn decommit(&self, _base: usize, _size: usize) -> MemoryResult<()> {
        Ok(())
    }

    unsafe fn release(&self, _base: usize, _size: usize) -> MemoryResult<()> {
        Ok(())
    }
}
