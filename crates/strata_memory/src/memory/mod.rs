//! # Memory Management
//!
//! Regions, allocators and segment handles.
//!
//! ## Design Principles
//!
//! 1. **Handles, not pointers**: a [`Segment`] re-reads its span on every
//!    access, so coalescing and compaction never leave it dangling
//! 2. **Lazy backing**: physical pages are committed on first allocation
//! 3. **Ownership tree**: parents own their child regions; children only
//!    remember their parent's id

mod allocator;
mod instance;
mod page;
mod range;
mod raw;
mod region;
mod segment;
mod table;

pub use allocator::{
    Allocator, Backing, Binding, BlockAllocator, CompactionPolicy, FreeListAllocator, NoCommit, PageCommit,
};
pub use instance::Instance;
#[cfg(unix)]
pub use page::MmapBackend;
pub use page::{HeapBackend, PageBackend, PageState, SystemBackend};
pub use range::Range;
pub use region::{MemoryRegion, RegionId};
pub use segment::Segment;
pub use table::SlotId;
