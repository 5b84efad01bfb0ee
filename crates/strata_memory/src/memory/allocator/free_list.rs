//! # Free-List Allocator
//!
//! Variable-size allocator over a sorted list of free spans.
//!
//! ## Layout
//!
//! ```text
//! span:      [======================================================)
//! committed: [ A )      [  B  )  [C)
//! free:           [ f0 )       [)   [            f1               )
//! ```
//!
//! - Allocation is first-fit in address order.
//! - Freed spans are merged with touching neighbours immediately.
//! - `compact()` slides committed spans down into earlier gaps. Segments
//!   observe the move because they reference the slot, not a copy.

// SAFETY: Zeroing and relocation touch raw span memory, only for physically
// backed allocators and only inside spans this allocator owns.
#![allow(unsafe_code)]

use std::cmp::Reverse;

use serde::{Deserialize, Serialize};

use super::{sealed, Allocator, Backing, Binding, PageCommit};
use crate::error::MemoryResult;
use crate::memory::range::{align_up, Range};
use crate::memory::raw;
use crate::memory::segment::Segment;
use crate::memory::table::{RangeTable, SharedTable, SlotId};

/// Which committed span `compact()` moves into a gap.
///
/// Only spans at a higher address than the gap and no larger than it are
/// candidates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionPolicy {
    /// The lowest-addressed candidate.
    #[default]
    FirstFit,
    /// The largest candidate, ties broken by lowest address.
    BestFit,
}

impl CompactionPolicy {
    fn select(self, candidates: impl Iterator<Item = (SlotId, Range)>) -> Option<(SlotId, Range)> {
        match self {
            Self::FirstFit => candidates.min_by_key(|(_, range)| range.begin()),
            Self::BestFit => candidates.max_by_key(|(_, range)| (range.size(), Reverse(range.begin()))),
        }
    }
}

/// Coalescing, compactable allocator for variable-size spans.
///
/// # Example
///
/// ```rust,ignore
/// let mut region = MemoryRegion::new(1 << 20, 16, Box::new(FreeListAllocator::new(Backing::Physical)))?;
///
/// let mut segment = region.allocate(100).unwrap(); // rounded up to 112
/// region.deallocate(&mut segment);
/// ```
#[derive(Debug)]
pub struct FreeListAllocator {
    backing: Backing,
    policy: CompactionPolicy,
    binding: Binding,
    /// Free spans, sorted by address, never empty, never touching.
    free: Vec<Range>,
    /// Committed slots, sorted by the address they currently hold.
    committed: Vec<SlotId>,
    /// Storage the committed slots live in.
    table: SharedTable,
    /// Vacant slot indices ready for reuse.
    vacant: Vec<u32>,
}

impl FreeListAllocator {
    /// Creates an unbound allocator.
    #[must_use]
    pub fn new(backing: Backing) -> Self {
        Self {
            backing,
            policy: CompactionPolicy::default(),
            binding: Binding::UNBOUND,
            free: Vec::new(),
            committed: Vec::new(),
            table: RangeTable::new().into_shared(),
            vacant: Vec::new(),
        }
    }

    /// Sets the compaction policy.
    #[must_use]
    pub fn with_policy(mut self, policy: CompactionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The compaction policy in use.
    #[inline]
    #[must_use]
    pub const fn policy(&self) -> CompactionPolicy {
        self.policy
    }

    /// Number of free entries (a fragmentation indicator).
    #[inline]
    #[must_use]
    pub fn free_entries(&self) -> usize {
        self.free.len()
    }

    /// Index of the first free span that can hold `size` bytes at
    /// `alignment`, together with the aligned span.
    fn find_fit(&self, size: usize, alignment: usize) -> Option<(usize, Range)> {
        self.free.iter().enumerate().find_map(|(index, free)| {
            if free.size() < size {
                return None;
            }
            let begin = align_up(free.begin(), alignment)?;
            let end = begin.checked_add(size)?;
            (end <= free.end()).then(|| (index, Range::new(begin, end)))
        })
    }

    /// Removes `span` from the free entry at `index`, keeping the padding
    /// before it and the remainder after it as separate free entries.
    fn carve(&mut self, index: usize, span: Range) {
        let free = self.free[index];
        let head = Range::new(free.begin(), span.begin());
        let tail = Range::new(span.end(), free.end());
        match (head.is_empty(), tail.is_empty()) {
            (true, true) => {
                self.free.remove(index);
            }
            (true, false) => self.free[index] = tail,
            (false, true) => self.free[index] = head,
            (false, false) => {
                self.free[index] = head;
                self.free.insert(index + 1, tail);
            }
        }
    }

    /// Stores `span` in a slot and records it in address order.
    fn insert_committed(&mut self, span: Range) -> SlotId {
        let mut table = self.table.borrow_mut();
        let id = self
            .vacant
            .pop()
            .and_then(|index| table.occupy(index, span))
            .unwrap_or_else(|| table.push(span));
        let position = self
            .committed
            .partition_point(|other| table.get(*other).is_some_and(|range| range.begin() < span.begin()));
        self.committed.insert(position, id);
        id
    }

    /// Shrinks, splits or removes the committed entry containing `range`.
    ///
    /// Returns `false` if no single committed entry contains it.
    fn release_committed(&mut self, range: Range) -> bool {
        let tail = {
            let mut table = self.table.borrow_mut();
            let found = self.committed.iter().enumerate().find_map(|(position, id)| {
                table
                    .get(*id)
                    .filter(|entry| entry.contains(&range))
                    .map(|entry| (position, *id, entry))
            });
            let Some((position, id, entry)) = found else {
                return false;
            };

            if entry == range {
                table.release(id);
                self.committed.remove(position);
                self.vacant.push(id.index());
                None
            } else if entry.begin() == range.begin() {
                table.set(id, Range::new(range.end(), entry.end()));
                None
            } else if entry.end() == range.end() {
                table.set(id, Range::new(entry.begin(), range.begin()));
                None
            } else {
                table.set(id, Range::new(entry.begin(), range.begin()));
                Some(Range::new(range.end(), entry.end()))
            }
        };

        if let Some(tail) = tail {
            self.insert_committed(tail);
        }
        true
    }

    /// Returns `range` to the free list, merging with touching spans.
    fn insert_free(free: &mut Vec<Range>, range: Range) {
        if let Some(neighbour) = free.iter_mut().find(|entry| entry.touches(&range)) {
            *neighbour = neighbour.merged(&range);
        } else {
            let position = free.partition_point(|entry| entry.begin() < range.begin());
            free.insert(position, range);
        }
        Self::coalesce(free);
    }

    /// Merges every run of touching free spans into one.
    fn coalesce(free: &mut Vec<Range>) {
        free.dedup_by(|next, previous| {
            if previous.end() == next.begin() {
                previous.set_end(next.end());
                true
            } else {
                false
            }
        });
    }

    fn zero(&self, range: Range) {
        if self.backing.is_physical() {
            // SAFETY: `range` was committed by this allocator and is no
            // longer referenced by any live segment.
            unsafe { raw::zero(range) };
        }
    }
}

impl Default for FreeListAllocator {
    fn default() -> Self {
        Self::new(Backing::Physical)
    }
}

impl sealed::Sealed for FreeListAllocator {}

impl Allocator for FreeListAllocator {
    fn backing(&self) -> Backing {
        self.backing
    }

    fn bind(&mut self, binding: Binding) -> MemoryResult<()> {
        self.binding = binding;
        self.free.clear();
        if !binding.span.is_empty() {
            self.free.push(binding.span);
        }
        self.committed.clear();
        self.vacant.clear();
        self.table = RangeTable::new().into_shared();
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
        alignment: usize,
        pages: &mut dyn PageCommit,
    ) -> Option<Segment> {
        if size == 0 {
            return None;
        }
        let size = align_up(size, alignment)?;
        let (index, span) = self.find_fit(size, alignment)?;

        if !pages.commit(&span) {
            return None;
        }

        self.carve(index, span);
        let id = self.insert_committed(span);
        Some(Segment::new(&self.table, id, !self.backing.is_physical()))
    }

    fn deallocate(&mut self, segment: &mut Segment) -> bool {
        if !self.owns(segment) {
            return false;
        }
        let range = segment.range();
        if !self.deallocate_range(range) {
            return false;
        }
        segment.invalidate();
        true
    }

    fn deallocate_range(&mut self, range: Range) -> bool {
        if range.is_empty() || !self.binding.span.contains(&range) {
            return false;
        }
        if !self.release_committed(range) {
            return false;
        }
        Self::insert_free(&mut self.free, range);
        self.zero(range);
        true
    }

    fn owns(&self, segment: &Segment) -> bool {
        segment.belongs_to(&self.table)
            && self
                .table
                .borrow()
                .get(segment.slot())
                .is_some_and(|range| self.binding.span.contains(&range))
    }

    fn committed(&self) -> Vec<Range> {
        let table = self.table.borrow();
        let mut ranges: Vec<Range> = self.committed.iter().filter_map(|id| table.get(*id)).collect();
        ranges.sort_unstable();
        ranges
    }

    fn available(&self) -> Vec<Range> {
        self.free.clone()
    }

    fn compact(&mut self) {
        if self.committed.is_empty() || self.free.is_empty() {
            return;
        }

        let physical = self.backing.is_physical();
        let mut table = self.table.borrow_mut();
        let mut index = 0;

        while index < self.free.len() {
            let gap = self.free[index];
            let candidates = self
                .committed
                .iter()
                .filter_map(|id| table.get(*id).map(|range| (*id, range)))
                .filter(|(_, range)| range.begin() >= gap.end() && range.size() <= gap.size());

            let Some((id, old)) = self.policy.select(candidates) else {
                index += 1;
                continue;
            };

            let moved = Range::with_size(gap.begin(), old.size());
            if physical {
                // SAFETY: `old` is committed by this allocator and `moved`
                // lies in a free gap below it, inside the same span.
                unsafe {
                    raw::relocate(old, moved.begin());
                    raw::zero(old);
                }
            }
            table.set(id, moved);

            if moved.end() == gap.end() {
                self.free.remove(index);
            } else {
                self.free[index].set_begin(moved.end());
            }
            Self::insert_free(&mut self.free, old);
        }

        self.committed
            .sort_unstable_by_key(|id| table.get(*id).map_or(usize::MAX, |range| range.begin()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::allocator::NoCommit;

    fn bound(size: usize, alignment: usize) -> FreeListAllocator {
        let mut allocator = FreeListAllocator::new(Backing::Virtual);
        allocator.bind(Binding::new(Range::new(0, size), alignment)).unwrap();
        allocator
    }

    #[test]
    fn test_allocate_rounds_to_alignment() {
        let mut allocator = bound(256, 16);
        let segment = allocator.allocate(10, &mut NoCommit).unwrap();

        assert_eq!(segment.range(), Range::new(0, 16));
        assert!(segment.is_virtual());
        assert_eq!(allocator.available(), vec![Range::new(16, 256)]);
        assert!(allocator.allocate(0, &mut NoCommit).is_none());
    }

    #[test]
    fn test_first_fit_keeps_padding_free() {
        let mut allocator = bound(64, 1);
        let segment = allocator.allocate_aligned(8, 16, &mut NoCommit).unwrap();
        assert_eq!(segment.range(), Range::new(0, 16));

        let mut allocator = bound(64, 1);
        let _first = allocator.allocate(3, &mut NoCommit).unwrap();
        let second = allocator.allocate_aligned(8, 8, &mut NoCommit).unwrap();
        assert_eq!(second.range(), Range::new(8, 16));
        assert_eq!(allocator.available(), vec![Range::new(3, 8), Range::new(16, 64)]);
    }

    #[test]
    fn test_out_of_space() {
        let mut allocator = bound(32, 1);
        let _a = allocator.allocate(32, &mut NoCommit).unwrap();
        assert!(allocator.allocate(1, &mut NoCommit).is_none());
    }

    #[test]
    fn test_refused_commit_leaves_bookkeeping_untouched() {
        struct Refuse;
        impl PageCommit for Refuse {
            fn commit(&mut self, _range: &Range) -> bool {
                false
            }
        }

        let mut allocator = bound(64, 1);
        assert!(allocator.allocate(8, &mut Refuse).is_none());
        assert_eq!(allocator.available(), vec![Range::new(0, 64)]);
        assert!(allocator.committed().is_empty());
    }

    #[test]
    fn test_deallocate_coalesces_neighbours() {
        let mut allocator = bound(48, 1);
        let mut a = allocator.allocate(16, &mut NoCommit).unwrap();
        let mut b = allocator.allocate(16, &mut NoCommit).unwrap();
        let mut c = allocator.allocate(16, &mut NoCommit).unwrap();
        assert!(allocator.available().is_empty());

        assert!(allocator.deallocate(&mut a));
        assert!(allocator.deallocate(&mut c));
        assert_eq!(allocator.free_entries(), 2);

        assert!(allocator.deallocate(&mut b));
        assert_eq!(allocator.available(), vec![Range::new(0, 48)]);
        assert!(!a.is_valid());
        assert_eq!(a.range(), Range::EMPTY);
    }

    #[test]
    fn test_double_free_and_foreign_free_fail() {
        let mut first = bound(64, 1);
        let mut second = bound(64, 1);
        let mut segment = first.allocate(8, &mut NoCommit).unwrap();
        let mut stale = segment.clone();

        assert!(!second.owns(&segment));
        assert!(!second.deallocate(&mut segment));
        assert!(first.deallocate(&mut segment));
        assert!(!first.deallocate(&mut stale));
        assert!(!first.deallocate(&mut Segment::invalid()));
    }

    #[test]
    fn test_stale_handle_does_not_see_reused_slot() {
        let mut allocator = bound(64, 1);
        let mut segment = allocator.allocate(8, &mut NoCommit).unwrap();
        let stale = segment.clone();
        assert!(allocator.deallocate(&mut segment));

        let fresh = allocator.allocate(8, &mut NoCommit).unwrap();
        assert!(fresh.is_valid());
        assert!(!stale.is_valid());
        assert!(!allocator.owns(&stale));
    }

    #[test]
    fn test_deallocate_range_splits_committed_entry() {
        let mut allocator = bound(64, 1);
        let segment = allocator.allocate(32, &mut NoCommit).unwrap();

        // Interior release splits the entry in two.
        assert!(allocator.deallocate_range(Range::new(8, 16)));
        assert_eq!(allocator.committed(), vec![Range::new(0, 8), Range::new(16, 32)]);
        assert_eq!(segment.range(), Range::new(0, 8));

        // Front and back releases shrink the entries.
        assert!(allocator.deallocate_range(Range::new(16, 20)));
        assert!(allocator.deallocate_range(Range::new(28, 32)));
        assert_eq!(allocator.committed(), vec![Range::new(0, 8), Range::new(20, 28)]);
        assert_eq!(
            allocator.available(),
            vec![Range::new(8, 20), Range::new(28, 64)]
        );

        // Spans crossing entries or already free are rejected.
        assert!(!allocator.deallocate_range(Range::new(4, 24)));
        assert!(!allocator.deallocate_range(Range::new(40, 48)));
        assert!(!allocator.deallocate_range(Range::new(60, 70)));
    }

    #[test]
    fn test_compact_preserves_segment_identity() {
        let mut allocator = bound(64, 1);
        let mut a = allocator.allocate(16, &mut NoCommit).unwrap();
        let b = allocator.allocate(8, &mut NoCommit).unwrap();
        let mut c = allocator.allocate(8, &mut NoCommit).unwrap();
        let d = allocator.allocate(16, &mut NoCommit).unwrap();
        assert!(allocator.deallocate(&mut a));
        assert!(allocator.deallocate(&mut c));

        allocator.compact();

        assert!(b.is_valid());
        assert!(d.is_valid());
        assert_eq!(b.range(), Range::new(0, 8));
        assert_eq!(d.range(), Range::new(8, 24));
        assert_eq!(allocator.available(), vec![Range::new(24, 64)]);
        assert_eq!(allocator.used_size() + allocator.free_size(), 64);
    }

    #[test]
    fn test_best_fit_policy_prefers_largest_candidate() {
        let mut allocator = FreeListAllocator::new(Backing::Virtual).with_policy(CompactionPolicy::BestFit);
        allocator.bind(Binding::new(Range::new(0, 64), 1)).unwrap();
        let mut gap = allocator.allocate(16, &mut NoCommit).unwrap();
        let small = allocator.allocate(4, &mut NoCommit).unwrap();
        let large = allocator.allocate(12, &mut NoCommit).unwrap();
        assert!(allocator.deallocate(&mut gap));

        allocator.compact();

        assert_eq!(large.range(), Range::new(0, 12));
        assert_eq!(small.range(), Range::new(12, 16));
        assert_eq!(allocator.available(), vec![Range::new(16, 64)]);
    }

    #[test]
    fn test_physical_compaction_moves_bytes() {
        let mut buffer = vec![0u8; 64];
        let base = buffer.as_mut_ptr() as usize;
        let mut allocator = FreeListAllocator::new(Backing::Physical);
        allocator.bind(Binding::new(Range::with_size(base, 64), 1)).unwrap();

        let mut first = allocator.allocate(16, &mut NoCommit).unwrap();
        let second = allocator.allocate(4, &mut NoCommit).unwrap();
        unsafe { raw::write(second.range(), &[7, 8, 9, 10]) };
        assert!(allocator.deallocate(&mut first));

        allocator.compact();

        assert_eq!(second.range().begin(), base);
        assert_eq!(&buffer[..4], &[7, 8, 9, 10]);
        assert!(buffer[4..].iter().all(|byte| *byte == 0));
    }
}
