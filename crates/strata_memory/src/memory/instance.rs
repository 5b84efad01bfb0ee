//! # Typed Instances
//!
//! Places arbitrary values inside a physically backed region. The region
//! keeps the bytes; the caller keeps an [`Instance`] handle and must give
//! it back through [`MemoryRegion::destroy`] or [`MemoryRegion::take`] for
//! the value to be dropped. A handle that is simply forgotten leaks the
//! value (its destructor never runs) until the region itself goes away.

// SAFETY: Values are written into freshly allocated, committed spans of at
// least `size_of::<T>()` bytes and only reached again through a handle that
// the region still owns.
#![allow(unsafe_code)]

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr;

use super::region::MemoryRegion;
use super::segment::Segment;

/// Handle to a `T` living inside a [`MemoryRegion`].
///
/// The underlying segment is not exposed, so the value can only be reached
/// through the region's typed accessors.
pub struct Instance<T> {
    segment: Segment,
    /// Size of the span at creation. A live span of any other size was
    /// partially released and no longer holds a whole `T`.
    size: usize,
    marker: PhantomData<T>,
}

impl<T> Instance<T> {
    fn address(&self) -> usize {
        self.segment.range().begin()
    }

    /// Whether the value currently sits on a `T`-aligned address.
    /// Compaction may move it elsewhere.
    fn is_aligned(&self) -> bool {
        self.address() % mem::align_of::<T>() == 0
    }
}

impl<T> fmt::Debug for Instance<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("type", &std::any::type_name::<T>())
            .field("segment", &self.segment)
            .finish()
    }
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Least common multiple, so that an address satisfies both alignments.
fn lcm(a: usize, b: usize) -> Option<usize> {
    (a / gcd(a, b)).checked_mul(b)
}

impl MemoryRegion {
    /// Moves `value` into the region.
    ///
    /// The allocation is aligned for both the region and `T`. Returns
    /// `None` on virtual regions or when the region is full.
    pub fn create<T>(&mut self, value: T) -> Option<Instance<T>> {
        if !self.is_physically_backed() {
            tracing::warn!("Cannot place a {} in virtual {}", std::any::type_name::<T>(), self.id());
            return None;
        }
        let alignment = lcm(self.alignment(), mem::align_of::<T>())?;
        let mut segment = self.allocate_aligned(mem::size_of::<T>().max(1), alignment)?;
        let range = segment.range();
        if !self.range().contains(&range) {
            self.deallocate(&mut segment);
            return None;
        }
        // SAFETY: fresh committed span inside the region, large enough and
        // aligned for `T`.
        unsafe { ptr::write(range.begin() as *mut T, value) };
        Some(Instance {
            segment,
            size: range.size(),
            marker: PhantomData,
        })
    }

    fn holds<T>(&self, instance: &Instance<T>) -> bool {
        self.owns(&instance.segment)
            && instance.segment.size() == instance.size
            && self.range().contains(&instance.segment.range())
    }

    /// Shared access to the value.
    ///
    /// Returns `None` if the handle belongs to another region, if part of
    /// its span was released, or if compaction moved the value to an
    /// address not aligned for `T`.
    #[must_use]
    pub fn get<T>(&self, instance: &Instance<T>) -> Option<&T> {
        if !self.holds(instance) || !instance.is_aligned() {
            return None;
        }
        // SAFETY: owned, initialized and aligned; borrowing `self` keeps
        // the region from moving it.
        Some(unsafe { &*(instance.address() as *const T) })
    }

    /// Exclusive access to the value.
    pub fn get_mut<T>(&mut self, instance: &Instance<T>) -> Option<&mut T> {
        if !self.holds(instance) || !instance.is_aligned() {
            return None;
        }
        // SAFETY: as in `get`, and `&mut self` rules out other borrows.
        Some(unsafe { &mut *(instance.address() as *mut T) })
    }

    /// Moves the value back out and frees its storage.
    pub fn take<T>(&mut self, instance: Instance<T>) -> Option<T> {
        if !self.holds(&instance) {
            tracing::warn!("Rejected take of {} in {}", instance.segment.range(), self.id());
            return None;
        }
        let Instance { mut segment, .. } = instance;
        // SAFETY: owned and initialized; the read tolerates a moved value.
        let value = unsafe { ptr::read_unaligned(segment.range().begin() as *const T) };
        self.deallocate(&mut segment);
        Some(value)
    }

    /// Drops the value and frees its storage.
    ///
    /// Returns `false`, leaving the value untouched, if the handle does not
    /// belong to this region.
    pub fn destroy<T>(&mut self, instance: Instance<T>) -> bool {
        self.take(instance).is_some()
    }
}
