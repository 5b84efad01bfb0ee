//! # Range Slot Table
//!
//! Stable storage for the committed ranges an allocator hands out.
//!
//! Every committed range lives in a slot that never moves for the lifetime
//! of the allocation. Coalescing, splitting and compaction rewrite the
//! range *inside* the slot, and segments re-read it on every access.
//!
//! Slots are addressed by a [`SlotId`]:
//! - Lower 32 bits: Index into the slot array
//! - Upper 32 bits: Generation counter for detecting stale handles

use std::cell::RefCell;
use std::rc::Rc;

use super::range::Range;

/// Slot table shared between an allocator and the segments it issued.
///
/// The allocator holds the only strong reference; segments hold weak ones,
/// so a segment that outlives its allocator reads as invalid.
pub(crate) type SharedTable = Rc<RefCell<RangeTable>>;

/// Identifier of a slot in a [`RangeTable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct SlotId(u64);

impl SlotId {
    /// Creates a new slot ID from index and generation.
    #[inline]
    #[must_use]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | (index as u64))
    }

    /// Returns the index portion of the slot ID.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    /// Returns the generation portion of the slot ID.
    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Null/invalid slot ID.
    pub const NULL: Self = Self(u64::MAX);

    /// Checks if this slot ID is null/invalid.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == u64::MAX
    }
}

impl Default for SlotId {
    fn default() -> Self {
        Self::NULL
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Slot {
    range: Range,
    generation: u32,
    live: bool,
}

/// Generation-checked storage of ranges.
///
/// The table does not track vacancy itself; each allocator keeps its own
/// free-index stack and decides which slot to occupy.
#[derive(Debug, Default)]
pub(crate) struct RangeTable {
    slots: Vec<Slot>,
}

impl RangeTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table with `count` vacant slots.
    pub fn with_slots(count: usize) -> Self {
        Self {
            slots: vec![Slot::default(); count],
        }
    }

    /// Wraps the table for sharing with segments.
    pub fn into_shared(self) -> SharedTable {
        Rc::new(RefCell::new(self))
    }

    /// Number of slots, live or vacant.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Appends a new live slot holding `range`.
    pub fn push(&mut self, range: Range) -> SlotId {
        let index = u32::try_from(self.slots.len()).expect("range table exceeded u32::MAX slots");
        self.slots.push(Slot {
            range,
            generation: 0,
            live: true,
        });
        SlotId::new(index, 0)
    }

    /// Makes the vacant slot at `index` live with `range`.
    ///
    /// Returns `None` if the index is out of bounds or the slot is live.
    pub fn occupy(&mut self, index: u32, range: Range) -> Option<SlotId> {
        let slot = self.slots.get_mut(index as usize)?;
        if slot.live {
            return None;
        }
        slot.range = range;
        slot.live = true;
        Some(SlotId::new(index, slot.generation))
    }

    /// Vacates a live slot, bumping its generation.
    ///
    /// Returns the range it held, or `None` for stale or vacant ids.
    pub fn release(&mut self, id: SlotId) -> Option<Range> {
        let slot = self.live_slot_mut(id)?;
        let range = slot.range;
        slot.range = Range::EMPTY;
        slot.live = false;
        slot.generation = slot.generation.wrapping_add(1);
        Some(range)
    }

    /// Current range of a live slot.
    pub fn get(&self, id: SlotId) -> Option<Range> {
        if id.is_null() {
            return None;
        }
        self.slots
            .get(id.index() as usize)
            .filter(|slot| slot.live && slot.generation == id.generation())
            .map(|slot| slot.range)
    }

    /// Rewrites the range of a live slot in place.
    pub fn set(&mut self, id: SlotId, range: Range) -> bool {
        match self.live_slot_mut(id) {
            Some(slot) => {
                slot.range = range;
                true
            }
            None => false,
        }
    }

    /// Returns `true` if `id` refers to a live slot of the current generation.
    pub fn is_live(&self, id: SlotId) -> bool {
        self.get(id).is_some()
    }

    /// Id of the live slot at `index`, if any.
    pub fn live_id(&self, index: u32) -> Option<SlotId> {
        self.slots
            .get(index as usize)
            .filter(|slot| slot.live)
            .map(|slot| SlotId::new(index, slot.generation))
    }

    fn live_slot_mut(&mut self, id: SlotId) -> Option<&mut Slot> {
        if id.is_null() {
            return None;
        }
        self.slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.live && slot.generation == id.generation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_id_roundtrip() {
        let id = SlotId::new(12345, 67890);
        assert_eq!(id.index(), 12345);
        assert_eq!(id.generation(), 67890);
        assert!(SlotId::default().is_null());
    }

    #[test]
    fn test_release_bumps_generation() {
        let mut table = RangeTable::new();
        let id = table.push(Range::new(0, 16));
        assert_eq!(table.get(id), Some(Range::new(0, 16)));

        assert_eq!(table.release(id), Some(Range::new(0, 16)));
        assert!(!table.is_live(id));
        assert_eq!(table.release(id), None);

        let reused = table.occupy(id.index(), Range::new(32, 48)).unwrap();
        assert_eq!(reused.index(), id.index());
        assert_ne!(reused.generation(), id.generation());
        // The stale id must not observe the new occupant.
        assert_eq!(table.get(id), None);
        assert_eq!(table.get(reused), Some(Range::new(32, 48)));
    }

    #[test]
    fn test_set_rewrites_in_place() {
        let mut table = RangeTable::with_slots(2);
        assert_eq!(table.len(), 2);
        let id = table.occupy(1, Range::new(8, 16)).unwrap();
        assert!(table.occupy(1, Range::new(0, 4)).is_none());

        assert!(table.set(id, Range::new(0, 8)));
        assert_eq!(table.get(id), Some(Range::new(0, 8)));
        assert_eq!(table.live_id(1), Some(id));
        assert_eq!(table.live_id(0), None);
    }
}
