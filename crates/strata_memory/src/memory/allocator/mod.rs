//! # Allocators
//!
//! An allocator decides how the span of a [`MemoryRegion`] is carved into
//! segments. Two policies are provided:
//!
//! - [`FreeListAllocator`]: variable-size, first-fit, coalescing, compactable
//! - [`BlockAllocator`]: fixed-size slot pool, O(1) allocate and free
//!
//! An allocator is bound to exactly one region. The region owns it, tells
//! it its span once through [`Allocator::bind`], and passes a
//! [`PageCommit`] hook on every allocation so the allocator can ask for
//! physical pages without holding a reference back to the region.
//!
//! Regions read and write the spans their allocator hands out, so the
//! trait is sealed and binding is reserved to the region itself.
//!
//! [`MemoryRegion`]: crate::memory::MemoryRegion

mod block;
mod free_list;

pub use block::BlockAllocator;
pub use free_list::{CompactionPolicy, FreeListAllocator};

use serde::{Deserialize, Serialize};

use super::range::Range;
use super::segment::Segment;
use crate::error::MemoryResult;

/// Whether an allocator's spans correspond to real memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backing {
    /// Spans are reserved from the platform and committed page by page.
    #[default]
    Physical,
    /// Spans are bookkeeping only (for example GPU-resident data mirrored
    /// on the host). Nothing is ever read or written.
    Virtual,
}

impl Backing {
    /// Returns `true` for [`Backing::Physical`].
    #[inline]
    #[must_use]
    pub const fn is_physical(self) -> bool {
        matches!(self, Self::Physical)
    }
}

impl From<bool> for Backing {
    fn from(physically_backed: bool) -> Self {
        if physically_backed {
            Self::Physical
        } else {
            Self::Virtual
        }
    }
}

/// Hook through which an allocator asks its region to back a span with
/// physical pages before handing it out.
pub trait PageCommit {
    /// Commits every page under `range`. Returns `false` if the platform
    /// refused.
    fn commit(&mut self, range: &Range) -> bool;
}

/// Committer that accepts everything without touching the platform.
///
/// Used for virtual regions and for spans handed to child regions, which
/// commit lazily on their own.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCommit;

impl PageCommit for NoCommit {
    fn commit(&mut self, _range: &Range) -> bool {
        true
    }
}

mod sealed {
    pub trait Sealed {}
}

/// The span and alignment an allocator was bound to.
///
/// Only a [`MemoryRegion`](crate::memory::MemoryRegion) can create one,
/// for the span it reserved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Binding {
    span: Range,
    alignment: usize,
}

impl Binding {
    /// State of an allocator no region has bound yet.
    pub(crate) const UNBOUND: Self = Self {
        span: Range::EMPTY,
        alignment: 0,
    };

    pub(crate) const fn new(span: Range, alignment: usize) -> Self {
        Self { span, alignment }
    }

    /// The bound span.
    #[inline]
    #[must_use]
    pub const fn span(&self) -> Range {
        self.span
    }

    /// Default alignment of the owning region.
    #[inline]
    #[must_use]
    pub const fn alignment(&self) -> usize {
        self.alignment
    }
}

/// Allocation policy bound to a single memory region.
///
/// The trait is sealed: [`FreeListAllocator`] and [`BlockAllocator`] are
/// the only implementations. Binding happens inside the region, so an
/// allocator can never be pointed at memory the region does not own:
///
/// ```compile_fail
/// use strata_memory::{Allocator, Backing, FreeListAllocator};
///
/// let mut allocator = FreeListAllocator::new(Backing::Physical);
/// let _ = allocator.bind(Default::default());
/// ```
///
/// # Thread Safety
///
/// Allocators are NOT thread-safe. Use one per thread or guard the owning
/// region externally.
pub trait Allocator: sealed::Sealed {
    /// Whether handed-out spans are backed by real memory.
    fn backing(&self) -> Backing;

    /// Binds the allocator to a region span and seeds its free bookkeeping
    /// to cover the whole span. Any previous state is discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the span cannot be managed by this policy.
    fn bind(&mut self, binding: Binding) -> MemoryResult<()>;

    /// The span this allocator manages ([`Range::EMPTY`] before binding).
    fn span(&self) -> Range;

    /// Alignment of the owning region (`0` before binding).
    fn alignment(&self) -> usize;

    /// Allocates at least `size` bytes at the region's alignment.
    ///
    /// Returns `None` for `size == 0`, when no span is large enough after
    /// alignment, or when `pages` refuses to commit the span.
    fn allocate(&mut self, size: usize, pages: &mut dyn PageCommit) -> Option<Segment> {
        let alignment = self.alignment();
        self.allocate_aligned(size, alignment, pages)
    }

    /// Allocates at least `size` bytes with an explicit `alignment`.
    fn allocate_aligned(
        &mut self,
        size: usize,
        alignment: usize,
        pages: &mut dyn PageCommit,
    ) -> Option<Segment>;

    /// Returns the segment's bytes to the free pool and resets the segment
    /// to the invalid sentinel.
    ///
    /// Fails for segments this allocator does not currently own (foreign,
    /// stale, or already freed). Freed bytes are zeroed when physically
    /// backed.
    fn deallocate(&mut self, segment: &mut Segment) -> bool;

    /// Returns an arbitrary span to the free pool.
    ///
    /// The span must lie inside one committed entry. Releasing a prefix,
    /// suffix or interior piece shrinks or splits that entry; a segment
    /// referring to it keeps the part that starts at the original address.
    fn deallocate_range(&mut self, range: Range) -> bool;

    /// Exact-membership check: `true` only for live segments this
    /// allocator issued.
    fn owns(&self, segment: &Segment) -> bool;

    /// Snapshot of committed spans, sorted by address.
    fn committed(&self) -> Vec<Range>;

    /// Snapshot of free spans, sorted by address.
    fn available(&self) -> Vec<Range>;

    /// Relocates committed spans toward the low end of the span.
    ///
    /// Outstanding segments stay valid and observe their new location.
    /// Does nothing for allocators that cannot move spans.
    fn compact(&mut self) {}

    /// Returns `true` when spans are backed by real memory.
    #[inline]
    fn is_physically_backed(&self) -> bool {
        self.backing().is_physical()
    }

    /// Total bytes currently committed.
    fn used_size(&self) -> usize {
        self.committed().iter().map(Range::size).sum()
    }

    /// Total bytes currently free.
    fn free_size(&self) -> usize {
        self.available().iter().map(Range::size).sum()
    }
}
