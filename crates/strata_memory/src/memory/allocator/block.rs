//! # Block Allocator
//!
//! Fixed-size block pool for spans that are frequently allocated and freed.

// SAFETY: Freed blocks are zeroed through raw span access, only for
// physically backed allocators and only inside blocks this pool owns.
#![allow(unsafe_code)]

use super::{sealed, Allocator, Backing, Binding, PageCommit};
use crate::error::{MemoryError, MemoryResult};
use crate::memory::range::Range;
use crate::memory::raw;
use crate::memory::segment::Segment;
use crate::memory::table::{RangeTable, SharedTable};

/// A pool of equally sized blocks laid out back to back from the start of
/// the region span.
///
/// Every allocation hands out one whole block, whatever the requested size,
/// as long as the request fits in a block. Any tail of the span shorter
/// than a block is never used.
///
/// # Example
///
/// ```rust,ignore
/// let mut region = MemoryRegion::new(4096, 1, Box::new(BlockAllocator::new(64, Backing::Physical)))?;
///
/// // Allocate - O(1)
/// let mut segment = region.allocate(48).unwrap(); // 64 bytes
///
/// // Free - O(1)
/// region.deallocate(&mut segment);
/// ```
#[derive(Debug)]
pub struct BlockAllocator {
    block_size: usize,
    backing: Backing,
    binding: Binding,
    /// One slot per block; slot `i` always holds block `i` while live.
    table: SharedTable,
    /// Free list - indices of available blocks.
    free_list: Vec<u32>,
}

impl BlockAllocator {
    /// Creates an unbound pool of `block_size`-byte blocks.
    ///
    /// # Panics
    ///
    /// Panics if `block_size` is zero.
    #[must_use]
    pub fn new(block_size: usize, backing: Backing) -> Self {
        assert!(block_size > 0, "Block size must be greater than zero");
        Self {
            block_size,
            backing,
            binding: Binding::UNBOUND,
            table: RangeTable::new().into_shared(),
            free_list: Vec::new(),
        }
    }

    /// Size of every block.
    #[inline]
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of blocks in the pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.table.borrow().len()
    }

    /// Number of blocks currently handed out.
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.capacity() - self.free_list.len()
    }

    /// Number of free blocks.
    #[inline]
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    fn block_range(&self, index: u32) -> Range {
        Range::with_size(
            self.binding.span.begin() + index as usize * self.block_size,
            self.block_size,
        )
    }

    /// Block index of a span, if it is exactly one block of this pool.
    fn block_index(&self, range: Range) -> Option<u32> {
        if range.size() != self.block_size || !self.binding.span.contains(&range) {
            return None;
        }
        let offset = range.begin() - self.binding.span.begin();
        if offset % self.block_size != 0 {
            return None;
        }
        let index = u32::try_from(offset / self.block_size).ok()?;
        ((index as usize) < self.capacity()).then_some(index)
    }

    fn release(&mut self, index: u32) -> bool {
        let mut table = self.table.borrow_mut();
        let Some(id) = table.live_id(index) else {
            return false;
        };
        let Some(range) = table.release(id) else {
            return false;
        };
        drop(table);

        self.free_list.push(index);
        if self.backing.is_physical() {
            // SAFETY: the block was committed on allocation and its slot has
            // just been vacated.
            unsafe { raw::zero(range) };
        }
        true
    }
}

impl sealed::Sealed for BlockAllocator {}

impl Allocator for BlockAllocator {
    fn backing(&self) -> Backing {
        self.backing
    }

    fn bind(&mut self, binding: Binding) -> MemoryResult<()> {
        let blocks = binding.span.size() / self.block_size;
        let count = u32::try_from(blocks).map_err(|_| MemoryError::TooManyBlocks { blocks })?;
        self.binding = binding;
        self.table = RangeTable::with_slots(count as usize).into_shared();
        self.free_list.clear();
        self.free_list.extend((0..count).rev());
        Ok(())
    }

    fn span(&self) -> Range {
        self.binding.span
    }

    fn alignment(&self) -> usize {
        self.binding.alignment
    }

    fn allocate_aligned(
        &mut self,
        size: usize,
        _alignment: usize,
        pages: &mut dyn PageCommit,
    ) -> Option<Segment> {
        if size == 0 || size > self.block_size {
            return None;
        }
        let index = *self.free_list.last()?;
        let range = self.block_range(index);

        if !pages.commit(&range) {
            return None;
        }

        let id = self.table.borrow_mut().occupy(index, range)?;
        self.free_list.pop();
        Some(Segment::new(&self.table, id, !self.backing.is_physical()))
    }

    fn deallocate(&mut self, segment: &mut Segment) -> bool {
        if !self.owns(segment) {
            return false;
        }
        let Some(index) = self.block_index(segment.range()) else {
            return false;
        };
        if !self.release(index) {
            return false;
        }
        segment.invalidate();
        true
    }

    fn deallocate_range(&mut self, range: Range) -> bool {
        match self.block_index(range) {
            Some(index) => self.release(index),
            None => false,
        }
    }

    fn owns(&self, segment: &Segment) -> bool {
        segment.belongs_to(&self.table)
            && self.table.borrow().is_live(segment.slot())
            && self.block_index(segment.range()) == Some(segment.slot().index())
    }

    fn committed(&self) -> Vec<Range> {
        let table = self.table.borrow();
        (0..table.len())
            .filter_map(|index| u32::try_from(index).ok())
            .filter_map(|index| table.live_id(index).and_then(|id| table.get(id)))
            .collect()
    }

    fn available(&self) -> Vec<Range> {
        let mut free: Vec<Range> = self.free_list.iter().map(|index| self.block_range(*index)).collect();
        free.sort_unstable();
        free
    }
}
