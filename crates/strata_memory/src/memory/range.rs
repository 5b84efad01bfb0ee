//! # Address Ranges
//!
//! A half-open `[begin, end)` interval in an address space. Ranges are the
//! common currency between segments, allocators and regions.

use std::cmp::Ordering;
use std::fmt;

/// A `[begin, end)` address interval.
///
/// `begin <= end` is enforced at construction. Ranges order by `begin`
/// first, then by `end`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Range {
    begin: usize,
    end: usize,
}

impl Range {
    /// The zero-length range at address zero, used by invalid segments.
    pub const EMPTY: Self = Self { begin: 0, end: 0 };

    /// Creates a new range.
    ///
    /// # Panics
    ///
    /// Panics if `begin > end`.
    #[inline]
    #[must_use]
    pub const fn new(begin: usize, end: usize) -> Self {
        assert!(begin <= end, "range begin must not exceed its end");
        Self { begin, end }
    }

    /// Creates a range starting at `begin` spanning `size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if the end address overflows.
    #[inline]
    #[must_use]
    pub const fn with_size(begin: usize, size: usize) -> Self {
        match begin.checked_add(size) {
            Some(end) => Self { begin, end },
            None => panic!("range end overflows the address space"),
        }
    }

    /// First address in the range.
    #[inline]
    #[must_use]
    pub const fn begin(&self) -> usize {
        self.begin
    }

    /// One past the last address in the range.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> usize {
        self.end
    }

    /// Number of bytes covered.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.end - self.begin
    }

    /// Returns `true` for zero-length ranges.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// Returns `true` if `other` lies entirely inside `self`.
    #[inline]
    #[must_use]
    pub const fn contains(&self, other: &Range) -> bool {
        other.begin >= self.begin && other.end <= self.end
    }

    /// Returns `true` if `self` lies entirely inside `other`.
    #[inline]
    #[must_use]
    pub const fn is_contained_by(&self, other: &Range) -> bool {
        other.contains(self)
    }

    /// Returns `true` if the two ranges share at least one address.
    #[inline]
    #[must_use]
    pub const fn overlaps(&self, other: &Range) -> bool {
        self.begin < other.end && other.begin < self.end
    }

    /// Returns `true` if the ranges share a boundary (`self.end == other.begin`
    /// or `other.end == self.begin`).
    #[inline]
    #[must_use]
    pub const fn touches(&self, other: &Range) -> bool {
        other.begin == self.end || other.end == self.begin
    }

    /// Smallest range covering both `self` and a touching `other`.
    #[inline]
    pub(crate) fn merged(&self, other: &Range) -> Range {
        Range::new(self.begin.min(other.begin), self.end.max(other.end))
    }

    #[inline]
    pub(crate) fn set_begin(&mut self, begin: usize) {
        debug_assert!(begin <= self.end);
        self.begin = begin;
    }

    #[inline]
    pub(crate) fn set_end(&mut self, end: usize) {
        debug_assert!(self.begin <= end);
        self.end = end;
    }
}

impl PartialOrd for Range {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Range {
    fn cmp(&self, other: &Self) -> Ordering {
        self.begin
            .cmp(&other.begin)
            .then_with(|| self.end.cmp(&other.end))
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.begin, self.end)
    }
}

/// Rounds `value` up to the next multiple of `alignment`.
///
/// Alignments need not be powers of two. Returns `None` on overflow or a
/// zero alignment.
#[inline]
pub(crate) fn align_up(value: usize, alignment: usize) -> Option<usize> {
    if alignment == 0 {
        return None;
    }
    match value % alignment {
        0 => Some(value),
        rem => value.checked_add(alignment - rem),
    }
}

/// Rounds `value` down to a multiple of `alignment`.
#[inline]
pub(crate) fn align_down(value: usize, alignment: usize) -> usize {
    value - value % alignment
}
