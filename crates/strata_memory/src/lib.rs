//! # STRATA Memory
//!
//! Hierarchical memory arenas with pluggable allocation policies.
//!
//! - Regions reserve address space and commit pages lazily
//! - Allocators carve a region into segments (free-list or fixed blocks)
//! - Segments are stable handles that survive coalescing and compaction
//! - Regions nest: a child region manages one allocation of its parent
//!
//! ## Example
//!
//! ```rust,ignore
//! use strata_memory::{Backing, FreeListAllocator, MemoryRegion};
//!
//! let mut region = MemoryRegion::new(1 << 20, 16, Box::new(FreeListAllocator::new(Backing::Physical)))?;
//! let mut segment = region.allocate(256).unwrap();
//! region.write_bytes(&segment, b"hello");
//! region.deallocate(&mut segment);
//! ```
//!
//! ## Threading
//!
//! Nothing here is thread-safe. A region and everything it owns belong to
//! one thread at a time.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod error;
pub mod memory;

pub use config::{AllocatorConfig, RegionConfig};
pub use error::{MemoryError, MemoryResult};
pub use memory::{
    Allocator, Backing, Binding, BlockAllocator, CompactionPolicy, FreeListAllocator, HeapBackend, Instance,
    MemoryRegion, NoCommit, PageBackend, PageCommit, PageState, Range, RegionId, Segment,
    SystemBackend,
};
#[cfg(unix)]
pub use memory::MmapBackend;
