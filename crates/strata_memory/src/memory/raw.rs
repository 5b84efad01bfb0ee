//! # Raw Span Access
//!
//! The only place that turns addresses back into pointers. Allocators use
//! these to zero freed spans and to slide spans during compaction; regions
//! use them for typed reads and writes.

// SAFETY: Every function here dereferences plain addresses. Callers must only
// pass spans that lie inside committed, physically backed memory they own.
#![allow(unsafe_code)]

use std::ptr;

use bytemuck::Pod;

use super::range::Range;

/// Fills `range` with zero bytes.
///
/// # Safety
///
/// `range` must be committed, writable memory not aliased by a live reference.
pub(crate) unsafe fn zero(range: Range) {
    if range.is_empty() {
        return;
    }
    ptr::write_bytes(range.begin() as *mut u8, 0, range.size());
}

/// Copies the bytes of `from` to the span starting at `to`.
///
/// The spans may overlap.
///
/// # Safety
///
/// Both `from` and `[to, to + from.size())` must be committed, writable memory.
pub(crate) unsafe fn relocate(from: Range, to: usize) {
    if from.is_empty() || from.begin() == to {
        return;
    }
    ptr::copy(from.begin() as *const u8, to as *mut u8, from.size());
}

/// Copies `bytes` to the start of `range`.
///
/// # Safety
///
/// `range` must be committed, writable memory at least `bytes.len()` long.
pub(crate) unsafe fn write(range: Range, bytes: &[u8]) {
    debug_assert!(bytes.len() <= range.size());
    ptr::copy_nonoverlapping(bytes.as_ptr(), range.begin() as *mut u8, bytes.len());
}

/// Reads a `T` from the start of `range`, without alignment requirements.
///
/// # Safety
///
/// `range` must be committed, readable memory at least `size_of::<T>()` long.
pub(crate) unsafe fn read<T: Pod>(range: Range) -> T {
    debug_assert!(std::mem::size_of::<T>() <= range.size());
    let bytes = std::slice::from_raw_parts(range.begin() as *const u8, std::mem::size_of::<T>());
    bytemuck::pod_read_unaligned(bytes)
}
