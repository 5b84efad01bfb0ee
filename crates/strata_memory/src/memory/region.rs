//! # Memory Regions
//!
//! A region owns one address span and exactly one [`Allocator`] carving
//! it into segments. Regions form an ownership tree: a parent hands one of
//! its own allocations to each child, and the child manages that span with
//! its own allocator.
//!
//! ## Physical Backing
//!
//! Physically backed regions reserve their span from a [`PageBackend`]
//! (rounded up to the page size) and commit pages lazily, the first time
//! an allocation touches them. Virtual regions never touch memory: their
//! span starts at address zero and only exists as bookkeeping.
//!
//! ## Teardown
//!
//! Children must be destroyed through [`MemoryRegion::destroy_region`]
//! before their parent goes away. Destroying a region that still owns
//! children is a structural bug and panics.
//!
//! The platform reservation is shared by the whole tree and returned once
//! the last region using it is dropped, so a child moved out of its parent
//! through a mutable borrow never outlives its memory.

// SAFETY: Typed reads and writes go through `raw`, only for physically
// backed regions and only inside live segments this region owns.
#![allow(unsafe_code)]

use std::fmt;
use std::mem;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

use bytemuck::Pod;

use super::allocator::{Allocator, Binding, NoCommit, PageCommit};
use super::page::{PageBackend, PageMap, PageState, Reservation, SystemBackend};
use super::range::{align_up, Range};
use super::raw;
use super::segment::Segment;
use crate::config::RegionConfig;
use crate::error::{MemoryError, MemoryResult};

static NEXT_REGION_ID: AtomicU32 = AtomicU32::new(1);

/// Process-unique identifier of a memory region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(u32);

impl RegionId {
    fn next() -> Self {
        Self(NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region#{}", self.0)
    }
}

/// A child region together with the parent allocation backing it.
struct ChildRegion {
    /// Id of the region created in this slot.
    id: RegionId,
    region: MemoryRegion,
    segment: Segment,
}

impl ChildRegion {
    /// Whether the slot still holds the region created in it. Ids are
    /// unique, so any other region was swapped in from outside.
    fn is_intact(&self) -> bool {
        self.region.id == self.id
    }
}

/// An address span with a bound allocation policy.
///
/// # Example
///
/// ```rust,ignore
/// let mut region = MemoryRegion::new(1 << 20, 16, Box::new(FreeListAllocator::default()))?;
///
/// let segment = region.allocate(100).unwrap(); // 112 bytes, 16-byte aligned
/// region.write(&segment, &42u64);
/// assert_eq!(region.read::<u64>(&segment), Some(42));
/// ```
pub struct MemoryRegion {
    id: RegionId,
    parent: Option<RegionId>,
    span: Range,
    alignment: usize,
    allocator: Box<dyn Allocator>,
    pages: PageMap,
    children: Vec<ChildRegion>,
    /// Spans of replaced children. They may still be in use by the region
    /// that was moved out, so they are never freed or moved.
    stranded: Vec<Segment>,
}

impl MemoryRegion {
    /// Creates a root region of at least `size` bytes.
    ///
    /// Physically backed allocators get a reservation from the
    /// [`SystemBackend`]; virtual allocators get pure bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns an error for a zero size or alignment, or when the platform
    /// refuses the reservation.
    pub fn new(size: usize, alignment: usize, allocator: Box<dyn Allocator>) -> MemoryResult<Self> {
        Self::with_backend(size, alignment, allocator, Rc::new(SystemBackend::new()))
    }

    /// Creates a root region reserving its span from `backend`.
    ///
    /// The backend is ignored for virtual allocators.
    ///
    /// # Errors
    ///
    /// Same as [`MemoryRegion::new`].
    pub fn with_backend(
        size: usize,
        alignment: usize,
        allocator: Box<dyn Allocator>,
        backend: Rc<dyn PageBackend>,
    ) -> MemoryResult<Self> {
        if alignment == 0 {
            return Err(MemoryError::InvalidAlignment(alignment));
        }
        if size == 0 {
            return Err(MemoryError::InvalidSize(size));
        }

        let (span, pages) = if allocator.is_physically_backed() {
            let page_size = backend.page_size();
            let size = align_up(size, page_size).ok_or(MemoryError::InvalidSize(size))?;
            let reservation = Reservation::new(backend, size)?;
            let base = reservation.base();
            let states = vec![PageState::Reserved; size / page_size];
            (Range::with_size(base, size), PageMap::tracked(Rc::new(reservation), base, states))
        } else {
            (Range::with_size(0, size), PageMap::untracked())
        };

        let region = Self::assemble(None, span, alignment, allocator, pages)?;
        tracing::debug!(
            "Memory region {} reserved: {} ({} bytes, alignment {}, physical: {})",
            region.id,
            span,
            span.size(),
            alignment,
            region.is_physically_backed()
        );
        Ok(region)
    }

    /// Creates a root region from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidConfig`] for an invalid configuration,
    /// otherwise the same errors as [`MemoryRegion::new`].
    pub fn from_config(config: &RegionConfig) -> MemoryResult<Self> {
        config.validate()?;
        Self::new(config.size, config.alignment, config.build_allocator())
    }

    fn assemble(
        parent: Option<RegionId>,
        span: Range,
        alignment: usize,
        mut allocator: Box<dyn Allocator>,
        pages: PageMap,
    ) -> MemoryResult<Self> {
        allocator.bind(Binding::new(span, alignment))?;
        Ok(Self {
            id: RegionId::next(),
            parent,
            span,
            alignment,
            allocator,
            pages,
            children: Vec::new(),
            stranded: Vec::new(),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Identifier of this region.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> RegionId {
        self.id
    }

    /// Identifier of the parent region, `None` for a root.
    #[inline]
    #[must_use]
    pub const fn parent(&self) -> Option<RegionId> {
        self.parent
    }

    /// Returns `true` if this region has no parent.
    #[inline]
    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Base address of the span.
    #[inline]
    #[must_use]
    pub const fn data(&self) -> usize {
        self.span.begin()
    }

    /// Size of the span in bytes (page-rounded when physically backed).
    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.span.size()
    }

    /// Default alignment of allocations.
    #[inline]
    #[must_use]
    pub const fn alignment(&self) -> usize {
        self.alignment
    }

    /// The full span of this region.
    #[inline]
    #[must_use]
    pub const fn range(&self) -> Range {
        self.span
    }

    /// Returns `true` if segments of this region are backed by real memory.
    #[must_use]
    pub fn is_physically_backed(&self) -> bool {
        self.allocator.is_physically_backed()
    }

    /// The bound allocator.
    #[must_use]
    pub fn allocator(&self) -> &dyn Allocator {
        self.allocator.as_ref()
    }

    /// Page granularity (`1` for virtual regions).
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.pages.page_size()
    }

    /// Number of tracked pages (`0` for virtual regions).
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.page_count()
    }

    /// State of the page at `index`.
    #[must_use]
    pub fn page_state(&self, index: usize) -> Option<PageState> {
        self.pages.state(index)
    }

    /// Number of pages this region currently has committed.
    #[must_use]
    pub fn committed_pages(&self) -> usize {
        self.pages.count(PageState::Committed)
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocates at least `size` bytes at the region's alignment.
    ///
    /// Returns `None` for `size == 0`, when no free span is large enough,
    /// or when the pages under the span cannot be committed.
    pub fn allocate(&mut self, size: usize) -> Option<Segment> {
        self.allocator.allocate(size, &mut self.pages)
    }

    /// Allocates room for one `T`.
    pub fn allocate_for<T>(&mut self) -> Option<Segment> {
        self.allocate(mem::size_of::<T>())
    }

    pub(crate) fn allocate_aligned(&mut self, size: usize, alignment: usize) -> Option<Segment> {
        self.allocator.allocate_aligned(size, alignment, &mut self.pages)
    }

    /// Returns a segment to the allocator and resets it to the invalid
    /// sentinel. Returns `false` for segments this region does not own.
    pub fn deallocate(&mut self, segment: &mut Segment) -> bool {
        if self.allocator.deallocate(segment) {
            return true;
        }
        self.reject_deallocation(segment.range());
        false
    }

    fn reject_deallocation(&self, range: Range) {
        let rejected = MemoryError::InvalidDeallocation {
            begin: range.begin(),
            end: range.end(),
        };
        tracing::warn!("{} rejected: {}", self.id, rejected);
    }

    /// Deallocates the segment if there is one, leaving `None` behind on
    /// success.
    pub fn deallocate_opt(&mut self, segment: &mut Option<Segment>) -> bool {
        let Some(inner) = segment.as_mut() else {
            return false;
        };
        let released = self.deallocate(inner);
        if released {
            *segment = None;
        }
        released
    }

    /// Returns an arbitrary piece of one committed span to the allocator.
    ///
    /// Spans backing child regions cannot be released this way.
    pub fn deallocate_range(&mut self, range: Range) -> bool {
        let pinned = self.pinned().any(|span| span.overlaps(&range));
        if !pinned && self.allocator.deallocate_range(range) {
            return true;
        }
        self.reject_deallocation(range);
        false
    }

    /// Parent allocations that must stay where they are: child spans and
    /// stranded spans.
    fn pinned(&self) -> impl Iterator<Item = Range> + '_ {
        self.children
            .iter()
            .map(|child| child.segment.range())
            .chain(self.stranded.iter().map(Segment::range))
    }

    /// Returns `true` if `segment` is a live allocation of this region.
    #[must_use]
    pub fn owns(&self, segment: &Segment) -> bool {
        self.allocator.owns(segment)
    }

    // =========================================================================
    // Pages
    // =========================================================================

    /// Commits every page touched by `range`.
    ///
    /// Always succeeds for virtual regions. Fails for ranges outside the
    /// region or when the platform refuses.
    pub fn commit(&mut self, range: &Range) -> bool {
        if !self.span.contains(range) {
            return false;
        }
        PageCommit::commit(&mut self.pages, range)
    }

    /// Decommits the pages lying entirely inside free spans, keeping the
    /// reservation. Returns the number of pages released.
    pub fn decommit_unused(&mut self) -> usize {
        if !self.is_physically_backed() {
            return 0;
        }
        let mut released = 0;
        for free in self.allocator.available() {
            match self.pages.decommit_range(&free) {
                Ok(count) => released += count,
                Err(err) => tracing::warn!("Failed to decommit {} in {}: {}", free, self.id, err),
            }
        }
        tracing::debug!("Decommitted {} unused page(s) in {}", released, self.id);
        released
    }

    /// Slides committed spans toward the start of the region.
    ///
    /// Refused (returns `false`) while child regions are alive, or were
    /// ever replaced, since their spans cannot move.
    pub fn compact(&mut self) -> bool {
        let pinned = self.pinned().count();
        if pinned > 0 {
            tracing::warn!("Refusing to compact {}: {} span(s) pinned", self.id, pinned);
            return false;
        }
        // Spans are moved into free gaps, which may have been decommitted.
        if self.is_physically_backed() {
            for free in self.allocator.available() {
                if let Err(err) = self.pages.commit_range(&free) {
                    tracing::warn!("Refusing to compact {}: {}", self.id, err);
                    return false;
                }
            }
        }
        self.allocator.compact();
        tracing::debug!(
            "Compacted {}: {} bytes used, {} free span(s)",
            self.id,
            self.allocator.used_size(),
            self.allocator.available().len()
        );
        true
    }

    // =========================================================================
    // Child Regions
    // =========================================================================

    /// Carves a child region of `size` bytes out of this region.
    ///
    /// When physically backed, the child span is page aligned and rounded
    /// to whole pages so that it can be committed independently; its pages
    /// are handed over to the child and committed lazily by it.
    ///
    /// # Errors
    ///
    /// - [`MemoryError::BackingMismatch`] if `allocator` disagrees with
    ///   this region on physical backing
    /// - [`MemoryError::OutOfSpace`] if no free span can hold the child
    /// - [`MemoryError::InvalidAlignment`] if this region's allocator
    ///   cannot produce a page-aligned span
    pub fn create_region(
        &mut self,
        size: usize,
        alignment: usize,
        allocator: Box<dyn Allocator>,
    ) -> MemoryResult<RegionId> {
        let physical = self.is_physically_backed();
        if allocator.is_physically_backed() != physical {
            let mismatch = MemoryError::BackingMismatch {
                parent: physical,
                child: allocator.is_physically_backed(),
            };
            tracing::warn!("Rejected child of {}: {}", self.id, mismatch);
            return Err(mismatch);
        }
        if alignment == 0 {
            return Err(MemoryError::InvalidAlignment(alignment));
        }
        if size == 0 {
            return Err(MemoryError::InvalidSize(size));
        }

        let page_size = self.pages.page_size();
        let (request, span_alignment) = if physical {
            let request = align_up(size, page_size).ok_or(MemoryError::InvalidSize(size))?;
            (request, page_size)
        } else {
            (size, self.alignment)
        };

        let Some(segment) = self.allocator.allocate_aligned(request, span_alignment, &mut NoCommit) else {
            let exhausted = MemoryError::OutOfSpace {
                requested: request,
                available: self.allocator.free_size(),
            };
            tracing::warn!("Rejected child of {}: {}", self.id, exhausted);
            return Err(exhausted);
        };

        let span = segment.range();
        if physical && (span.begin() % page_size != 0 || span.size() % page_size != 0) {
            tracing::warn!("Rejected child of {}: {} is not page aligned", self.id, span);
            self.return_child_span(segment)?;
            return Err(MemoryError::InvalidAlignment(page_size));
        }

        let pages = if physical {
            let states = self.pages.states_in(&span);
            PageMap::tracked(Rc::clone(self.pages.reservation()), span.begin(), states)
        } else {
            PageMap::untracked()
        };

        let child = match Self::assemble(Some(self.id), span, alignment, allocator, pages) {
            Ok(child) => child,
            Err(err) => {
                tracing::warn!("Rejected child of {}: {}", self.id, err);
                self.return_child_span(segment)?;
                return Err(err);
            }
        };
        if physical {
            self.pages.mark(&span, PageState::DeferredToChild);
        }
        let id = child.id;
        tracing::debug!("Created child region {} of {} at {}", id, self.id, span);
        self.children.push(ChildRegion {
            id,
            region: child,
            segment,
        });
        Ok(id)
    }

    /// Frees a span carved for a child that could not be built.
    ///
    /// Freed spans are zeroed, so physical pages are committed first. If
    /// that fails the span stays allocated and the error is returned.
    fn return_child_span(&mut self, mut segment: Segment) -> MemoryResult<()> {
        let span = segment.range();
        if self.is_physically_backed() {
            if let Err(err) = self.pages.commit_range(&span) {
                tracing::warn!("Leaking {} in {}: {}", span, self.id, err);
                return Err(err);
            }
        }
        self.allocator.deallocate(&mut segment);
        Ok(())
    }

    /// Destroys a direct child and returns its span to this region.
    ///
    /// # Errors
    ///
    /// - [`MemoryError::UnknownRegion`] if `id` is not a direct child
    /// - a platform error if the span cannot be committed for zeroing; the
    ///   child is left in place and the call can be retried
    /// - [`MemoryError::ReplacedRegion`] if another region was swapped into
    ///   the child's place; the impostor is dropped and the span stays
    ///   reserved for good
    ///
    /// # Panics
    ///
    /// Panics if the child still owns child regions of its own.
    pub fn destroy_region(&mut self, id: RegionId) -> MemoryResult<()> {
        let index = self
            .children
            .iter()
            .position(|child| child.id == id)
            .ok_or(MemoryError::UnknownRegion(id))?;

        if !self.children[index].is_intact() {
            let ChildRegion { region, segment, .. } = self.children.remove(index);
            let replaced = MemoryError::ReplacedRegion(id);
            tracing::error!("Stranding {} in {}: {}", segment.range(), self.id, replaced);
            self.stranded.push(segment);
            drop(region);
            return Err(replaced);
        }

        let live = self.children[index].region.children.len();
        if live > 0 {
            let leak = MemoryError::LiveChildren { region: id, children: live };
            tracing::error!("Cannot destroy {}: {}", id, leak);
            panic!("{leak}");
        }

        let span = self.children[index].segment.range();
        if self.is_physically_backed() {
            let states = self.children[index].region.pages.states().to_vec();
            self.pages.adopt(&span, &states);
            if let Err(err) = self.pages.commit_range(&span) {
                // Hand the pages back as they are now; the child stays.
                let current = self.pages.states_in(&span);
                self.children[index].region.pages.adopt(&span, &current);
                self.pages.mark(&span, PageState::DeferredToChild);
                tracing::warn!("Cannot destroy {}: {}", id, err);
                return Err(err);
            }
        }

        let ChildRegion { region, mut segment, .. } = self.children.remove(index);
        drop(region);
        if !self.allocator.deallocate(&mut segment) {
            tracing::warn!("Span {} of destroyed {} was not owned by {}", span, id, self.id);
        }
        tracing::debug!("Destroyed child region {} of {}", id, self.id);
        Ok(())
    }

    /// Direct child with the given id.
    #[must_use]
    pub fn region(&self, id: RegionId) -> Option<&MemoryRegion> {
        self.children
            .iter()
            .find(|child| child.id == id && child.is_intact())
            .map(|child| &child.region)
    }

    /// Mutable access to the direct child with the given id.
    ///
    /// A region swapped in through this borrow is not adopted: the slot
    /// only answers to the original id, and destroying it strands the span.
    pub fn region_mut(&mut self, id: RegionId) -> Option<&mut MemoryRegion> {
        self.children
            .iter_mut()
            .find(|child| child.id == id && child.is_intact())
            .map(|child| &mut child.region)
    }

    /// Direct children, in creation order.
    pub fn children(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.children
            .iter()
            .filter(|child| child.is_intact())
            .map(|child| &child.region)
    }

    /// Number of child slots not yet destroyed, replaced ones included.
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    // =========================================================================
    // Data Access
    // =========================================================================

    fn accessible(&self, segment: &Segment, len: usize) -> Option<Range> {
        if !self.is_physically_backed() || !self.owns(segment) {
            return None;
        }
        let range = segment.range();
        (len <= range.size() && self.span.contains(&range)).then_some(range)
    }

    /// Copies `bytes` to the start of the segment.
    ///
    /// Returns `false` on virtual regions, for segments this region does
    /// not own, and when `bytes` does not fit.
    pub fn write_bytes(&mut self, segment: &Segment, bytes: &[u8]) -> bool {
        let Some(range) = self.accessible(segment, bytes.len()) else {
            return false;
        };
        // SAFETY: the segment is live, owned and committed, and large enough.
        unsafe { raw::write(range, bytes) };
        true
    }

    /// Copies a plain value to the start of the segment.
    pub fn write<T: Pod>(&mut self, segment: &Segment, value: &T) -> bool {
        self.write_bytes(segment, bytemuck::bytes_of(value))
    }

    /// Reads a plain value from the start of the segment.
    #[must_use]
    pub fn read<T: Pod>(&self, segment: &Segment) -> Option<T> {
        let range = self.accessible(segment, mem::size_of::<T>())?;
        // SAFETY: the segment is live, owned and committed, and large enough.
        Some(unsafe { raw::read(range) })
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("id", &self.id)
            .field("parent", &self.parent)
            .field("span", &self.span)
            .field("alignment", &self.alignment)
            .field("backing", &self.allocator.backing())
            .field("children", &self.children.len())
            .field("stranded", &self.stranded.len())
            .finish_non_exhaustive()
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        if !self.children.is_empty() {
            let leak = MemoryError::LiveChildren {
                region: self.id,
                children: self.children.len(),
            };
            tracing::error!("Dropping {}: {}", self.id, leak);
            if !std::thread::panicking() {
                panic!("{leak}");
            }
        }
        if self.is_root() {
            self.pages.retire();
        }
        tracing::debug!("Memory region {} dropped", self.id);
    }
}
