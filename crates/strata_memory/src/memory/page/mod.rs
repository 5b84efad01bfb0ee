//! # Page Management
//!
//! Platform address-space primitives and per-region page bookkeeping.
//!
//! ## Page Lifecycle
//!
//! ```text
//! reserve ──► Reserved ──commit──► Committed ──decommit──► Reserved
//!                │                     │
//!                └──── child span ─────┴──► DeferredToChild
//!
//! root dropped ──► Released
//! ```
//!
//! A [`PageBackend`] performs the platform calls; a [`PageMap`] remembers
//! which pages of one region are in which state so that commits and
//! decommits only touch the pages that need it. The reservation itself is
//! shared by every region of a tree and handed back to the platform when
//! the last of them is dropped.

// SAFETY: Backend page calls are only made on page-aligned runs inside the
// reservation held by the calling page map.
#![allow(unsafe_code)]

mod heap;
mod null;
#[cfg(unix)]
mod mmap;

pub use heap::HeapBackend;
#[cfg(unix)]
pub use mmap::MmapBackend;
pub(crate) use null::NullBackend;

use std::fmt;
use std::ops::Range as Span;
use std::rc::Rc;

use super::allocator::PageCommit;
use super::range::{align_down, align_up, Range};
use crate::error::MemoryResult;

/// Backend used for physically backed regions on this target.
#[cfg(unix)]
pub type SystemBackend = MmapBackend;

/// Backend used for physically backed regions on this target.
#[cfg(not(unix))]
pub type SystemBackend = HeapBackend;

/// Platform primitive for reserving and backing address space in
/// page-sized units.
///
/// # Safety
///
/// Regions read and write the memory a backend hands out without further
/// checks. An implementation must guarantee that:
///
/// - `page_size` is a non-zero power of two and never changes
/// - `reserve` returns the page-aligned base of `size` bytes of address
///   space that nothing else uses until it is released
/// - after `commit`, the span is readable and writable, and pages never
///   committed before read as zero
/// - after `decommit` and a later `commit`, the span reads as zero
pub unsafe trait PageBackend: fmt::Debug {
    /// Granularity of physical commitment in bytes.
    fn page_size(&self) -> usize;

    /// Reserves `size` bytes of address space without committing them.
    /// Returns the base address.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::PlatformReservation`] when the platform
    /// refuses.
    ///
    /// [`MemoryError::PlatformReservation`]: crate::error::MemoryError::PlatformReservation
    fn reserve(&self, size: usize) -> MemoryResult<usize>;

    /// Backs `[base, base + size)` with readable, writable memory.
    ///
    /// # Safety
    ///
    /// The span must be page aligned and lie inside a live reservation
    /// returned by `reserve` on this backend.
    ///
    /// # Errors
    ///
    /// Returns a platform error when the pages cannot be committed.
    unsafe fn commit(&self, base: usize, size: usize) -> MemoryResult<()>;

    /// Returns the physical pages under `[base, base + size)` to the
    /// platform, keeping the reservation.
    ///
    /// # Safety
    ///
    /// Same as [`PageBackend::commit`]; in addition nothing may still
    /// reference the bytes under the span.
    ///
    /// # Errors
    ///
    /// Returns a platform error when the pages cannot be decommitted.
    unsafe fn decommit(&self, base: usize, size: usize) -> MemoryResult<()>;

    /// Gives a whole reservation back to the platform.
    ///
    /// # Safety
    ///
    /// `base` and `size` must be exactly a live reservation returned by
    /// `reserve` on this backend, and nothing may use it afterwards.
    ///
    /// # Errors
    ///
    /// Returns a platform error when the mapping cannot be released.
    unsafe fn release(&self, base: usize, size: usize) -> MemoryResult<()>;
}

/// Address space reserved from a backend, released on drop.
#[derive(Debug)]
pub(crate) struct Reservation {
    backend: Rc<dyn PageBackend>,
    base: usize,
    size: usize,
}

impl Reservation {
    /// Reserves `size` bytes from `backend`.
    pub fn new(backend: Rc<dyn PageBackend>, size: usize) -> MemoryResult<Self> {
        let base = backend.reserve(size)?;
        Ok(Self { backend, base, size })
    }

    /// An empty reservation that owns no address space.
    fn none() -> Self {
        Self {
            backend: Rc::new(NullBackend::default()),
            base: 0,
            size: 0,
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn page_size(&self) -> usize {
        self.backend.page_size()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.size == 0 {
            return;
        }
        // SAFETY: the span is exactly what `reserve` returned, and the last
        // page map referring to it is gone.
        match unsafe { self.backend.release(self.base, self.size) } {
            Ok(()) => tracing::debug!("Released {} bytes at {:#x}", self.size, self.base),
            Err(err) => tracing::error!("Failed to release {:#x}: {}", self.base, err),
        }
    }
}

/// State of a single page in a region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PageState {
    /// Address space reserved, no physical memory behind it.
    #[default]
    Reserved,
    /// Backed by physical memory.
    Committed,
    /// Managed by a child region.
    DeferredToChild,
    /// Returned to the platform.
    Released,
}

/// Page table of one region plus the reservation shared with its whole
/// tree.
#[derive(Debug)]
pub(crate) struct PageMap {
    reservation: Rc<Reservation>,
    base: usize,
    page_size: usize,
    /// One entry per page. Empty for virtual regions.
    states: Vec<PageState>,
}

impl PageMap {
    /// Page map of a virtual region: nothing is tracked, every commit
    /// succeeds.
    pub fn untracked() -> Self {
        Self {
            reservation: Rc::new(Reservation::none()),
            base: 0,
            page_size: 1,
            states: Vec::new(),
        }
    }

    /// Page map over `states.len()` pages starting at `base`.
    ///
    /// The pages must lie inside `reservation`.
    pub fn tracked(reservation: Rc<Reservation>, base: usize, states: Vec<PageState>) -> Self {
        let page_size = reservation.page_size();
        debug_assert!(base >= reservation.base);
        debug_assert!(base + states.len() * page_size <= reservation.base + reservation.size);
        Self {
            reservation,
            base,
            page_size,
            states,
        }
    }

    pub fn reservation(&self) -> &Rc<Reservation> {
        &self.reservation
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> usize {
        self.states.len()
    }

    pub fn state(&self, index: usize) -> Option<PageState> {
        self.states.get(index).copied()
    }

    pub fn states(&self) -> &[PageState] {
        &self.states
    }

    pub fn count(&self, state: PageState) -> usize {
        self.states.iter().filter(|page| **page == state).count()
    }

    /// Pages touched by `range`, rounded outward.
    fn touched(&self, range: &Range) -> Span<usize> {
        let start = range.begin().saturating_sub(self.base) / self.page_size;
        let end = align_up(range.end().saturating_sub(self.base), self.page_size)
            .map_or(self.states.len(), |offset| offset / self.page_size);
        start.min(self.states.len())..end.min(self.states.len())
    }

    /// Pages lying entirely inside `range`, rounded inward.
    fn covered(&self, range: &Range) -> Span<usize> {
        let start = align_up(range.begin().saturating_sub(self.base), self.page_size)
            .map_or(self.states.len(), |offset| offset / self.page_size);
        let end = align_down(range.end().saturating_sub(self.base), self.page_size) / self.page_size;
        let end = end.min(self.states.len());
        start.min(end)..end
    }

    fn page_address(&self, index: usize) -> usize {
        self.base + index * self.page_size
    }

    /// Maximal runs of consecutive pages in `pages` matching `predicate`.
    fn runs(&self, pages: Span<usize>, predicate: impl Fn(PageState) -> bool) -> Vec<Span<usize>> {
        let mut runs = Vec::new();
        let mut start = None;
        for index in pages.clone() {
            match (predicate(self.states[index]), start) {
                (true, None) => start = Some(index),
                (false, Some(first)) => {
                    runs.push(first..index);
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(first) = start {
            runs.push(first..pages.end);
        }
        runs
    }

    /// Commits every reserved page touched by `range`.
    ///
    /// Pages deferred to a child are left alone. Returns the number of pages
    /// newly committed.
    pub fn commit_range(&mut self, range: &Range) -> MemoryResult<usize> {
        let pages = self.touched(range);
        let mut committed = 0;
        for run in self.runs(pages, |state| matches!(state, PageState::Reserved)) {
            let base = self.page_address(run.start);
            let size = run.len() * self.page_size;
            // SAFETY: a page-aligned run of this map, inside the reservation.
            unsafe { self.reservation.backend.commit(base, size)? };
            tracing::trace!("Committed {} page(s) at {:#x}", run.len(), base);
            self.states[run.clone()].fill(PageState::Committed);
            committed += run.len();
        }
        Ok(committed)
    }

    /// Decommits every committed page lying entirely inside `range`.
    ///
    /// Returns the number of pages decommitted.
    pub fn decommit_range(&mut self, range: &Range) -> MemoryResult<usize> {
        let pages = self.covered(range);
        let mut decommitted = 0;
        for run in self.runs(pages, |state| matches!(state, PageState::Committed)) {
            let base = self.page_address(run.start);
            let size = run.len() * self.page_size;
            // SAFETY: a page-aligned run of this map, inside the reservation.
            // Callers only decommit pages under free spans.
            unsafe { self.reservation.backend.decommit(base, size)? };
            tracing::trace!("Decommitted {} page(s) at {:#x}", run.len(), base);
            self.states[run.clone()].fill(PageState::Reserved);
            decommitted += run.len();
        }
        Ok(decommitted)
    }

    /// Copies the states of the pages touched by `range`.
    pub fn states_in(&self, range: &Range) -> Vec<PageState> {
        self.states[self.touched(range)].to_vec()
    }

    /// Marks every page touched by `range` with `state`.
    pub fn mark(&mut self, range: &Range, state: PageState) {
        let pages = self.touched(range);
        self.states[pages].fill(state);
    }

    /// Overwrites the states of the pages touched by `range` with `states`
    /// (as returned by a child's page map).
    pub fn adopt(&mut self, range: &Range, states: &[PageState]) {
        let pages = self.touched(range);
        for (page, state) in self.states[pages].iter_mut().zip(states) {
            *page = *state;
        }
    }

    /// Marks every page as returned to the platform. The reservation
    /// itself goes back once no page map refers to it.
    pub fn retire(&mut self) {
        self.states.fill(PageState::Released);
    }
}

impl PageCommit for PageMap {
    fn commit(&mut self, range: &Range) -> bool {
        if self.states.is_empty() {
            return true;
        }
        match self.commit_range(range) {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!("Page commit refused for {}: {}", range, err);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::raw;

    fn map(pages: usize) -> PageMap {
        let backend: Rc<dyn PageBackend> = Rc::new(NullBackend::with_page_size(16));
        let reservation = Reservation::new(backend, pages * 16).unwrap();
        PageMap::tracked(Rc::new(reservation), 0, vec![PageState::Reserved; pages])
    }

    #[test]
    fn test_commit_rounds_outward() {
        let mut pages = map(4);
        assert_eq!(pages.commit_range(&Range::new(10, 20)).unwrap(), 2);
        assert_eq!(pages.state(0), Some(PageState::Committed));
        assert_eq!(pages.state(1), Some(PageState::Committed));
        assert_eq!(pages.state(2), Some(PageState::Reserved));

        // Already committed pages are not committed twice.
        assert_eq!(pages.commit_range(&Range::new(0, 48)).unwrap(), 1);
        assert_eq!(pages.count(PageState::Committed), 3);
    }

    #[test]
    fn test_decommit_rounds_inward() {
        let mut pages = map(4);
        pages.commit_range(&Range::new(0, 64)).unwrap();

        // Only page 1 lies entirely inside [10, 40).
        assert_eq!(pages.decommit_range(&Range::new(10, 40)).unwrap(), 1);
        assert_eq!(pages.state(0), Some(PageState::Committed));
        assert_eq!(pages.state(1), Some(PageState::Reserved));
        assert_eq!(pages.state(2), Some(PageState::Committed));
        assert_eq!(pages.decommit_range(&Range::new(20, 30)).unwrap(), 0);
    }

    #[test]
    fn test_deferred_pages_are_skipped() {
        let mut pages = map(4);
        pages.mark(&Range::new(16, 48), PageState::DeferredToChild);
        assert_eq!(pages.commit_range(&Range::new(0, 64)).unwrap(), 2);
        assert_eq!(pages.state(1), Some(PageState::DeferredToChild));
        assert_eq!(pages.states_in(&Range::new(16, 48)), vec![PageState::DeferredToChild; 2]);

        pages.adopt(&Range::new(16, 48), &[PageState::Reserved, PageState::Committed]);
        assert_eq!(pages.state(1), Some(PageState::Reserved));
        assert_eq!(pages.state(2), Some(PageState::Committed));
    }

    #[test]
    fn test_reservation_outlives_every_map() {
        let backend = Rc::new(HeapBackend::with_page_size(64));
        let reservation = Rc::new(Reservation::new(backend, 256).unwrap());
        let base = reservation.base();

        let mut root = PageMap::tracked(Rc::clone(&reservation), base, vec![PageState::Reserved; 4]);
        let mut child = PageMap::tracked(Rc::clone(&reservation), base + 128, vec![PageState::Reserved; 2]);
        drop(reservation);

        root.retire();
        drop(root);
        assert_eq!(child.commit_range(&Range::with_size(base + 128, 64)).unwrap(), 1);
        // SAFETY: the child's committed page is still reserved.
        unsafe { raw::write(Range::with_size(base + 128, 4), &[1, 2, 3, 4]) };
        assert_eq!(Rc::strong_count(child.reservation()), 1);
    }

    #[test]
    fn test_untracked_map_accepts_commits() {
        let mut pages = PageMap::untracked();
        assert!(PageCommit::commit(&mut pages, &Range::new(0, 1 << 20)));
        assert_eq!(pages.page_count(), 0);
    }
}
