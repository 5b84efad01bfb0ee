//! # Segments
//!
//! A segment is a handle to a committed range inside an allocator's
//! bookkeeping. It does not copy the range: every call to
//! [`Segment::range`] re-reads the live slot, so moves made by coalescing,
//! splitting or compaction are observed automatically.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use super::range::Range;
use super::table::{RangeTable, SharedTable, SlotId};

/// Handle to an allocated span.
///
/// The default segment is the invalid sentinel: it reports an empty range
/// at address zero. A segment turns invalid when it is deallocated, when
/// its slot is reused (generation mismatch) or when its allocator is gone.
#[derive(Clone, Default)]
pub struct Segment {
    table: Weak<RefCell<RangeTable>>,
    slot: SlotId,
    is_virtual: bool,
}

impl Segment {
    /// Creates a handle to `slot` inside `table`.
    pub(crate) fn new(table: &SharedTable, slot: SlotId, is_virtual: bool) -> Self {
        Self {
            table: Rc::downgrade(table),
            slot,
            is_virtual,
        }
    }

    /// The invalid sentinel segment.
    #[inline]
    #[must_use]
    pub fn invalid() -> Self {
        Self::default()
    }

    /// Current range of the segment, or [`Range::EMPTY`] if it is invalid.
    #[must_use]
    pub fn range(&self) -> Range {
        self.table
            .upgrade()
            .and_then(|table| table.borrow().get(self.slot))
            .unwrap_or(Range::EMPTY)
    }

    /// Number of bytes currently covered.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.range().size()
    }

    /// Returns `true` if the span is tracked only logically and never
    /// backed by real memory.
    #[inline]
    #[must_use]
    pub const fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    /// Returns `false` for the sentinel and for stale handles.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.table
            .upgrade()
            .is_some_and(|table| table.borrow().is_live(self.slot))
    }

    /// Slot this segment refers to.
    #[inline]
    pub(crate) const fn slot(&self) -> SlotId {
        self.slot
    }

    /// Returns `true` if the segment was issued from `table`.
    pub(crate) fn belongs_to(&self, table: &SharedTable) -> bool {
        std::ptr::eq(self.table.as_ptr(), Rc::as_ptr(table))
    }

    /// Resets the handle to the invalid sentinel.
    #[inline]
    pub(crate) fn invalidate(&mut self) {
        *self = Self::invalid();
    }
}

impl PartialEq for Segment {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot && self.table.ptr_eq(&other.table)
    }
}

impl Eq for Segment {}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("slot", &self.slot.index())
            .field("generation", &self.slot.generation())
            .field("range", &self.range())
            .field("is_virtual", &self.is_virtual)
            .field("is_valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_segment_is_sentinel() {
        let segment = Segment::default();
        assert!(!segment.is_valid());
        assert_eq!(segment.range(), Range::EMPTY);
        assert_eq!(segment.size(), 0);
    }

    #[test]
    fn test_segment_observes_live_range() {
        let table = RangeTable::new().into_shared();
        let id = table.borrow_mut().push(Range::new(0, 32));
        let segment = Segment::new(&table, id, false);
        assert!(segment.is_valid());
        assert!(segment.belongs_to(&table));

        table.borrow_mut().set(id, Range::new(64, 96));
        assert_eq!(segment.range(), Range::new(64, 96));

        let copy = segment.clone();
        assert_eq!(copy, segment);

        table.borrow_mut().release(id);
        assert!(!segment.is_valid());
        assert_eq!(copy.range(), Range::EMPTY);
    }

    #[test]
    fn test_segment_outliving_table_is_invalid() {
        let table = RangeTable::new().into_shared();
        let id = table.borrow_mut().push(Range::new(0, 8));
        let segment = Segment::new(&table, id, true);
        drop(table);

        assert!(!segment.is_valid());
        assert!(segment.is_virtual());
        assert_eq!(segment.range(), Range::EMPTY);
    }
}
