//! # Memory Error Types
//!
//! All errors that can occur while building or tearing down regions.
//!
//! The hot allocation boundary does not use these: `allocate` returns an
//! `Option` and `deallocate` a `bool`. Errors show up where a caller can
//! still react, such as constructing a region, creating or destroying a
//! child region, or loading configuration.

use crate::memory::RegionId;
use thiserror::Error;

/// Errors that can occur in the memory subsystem.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// Alignment of zero was requested.
    #[error("invalid alignment: {0}")]
    InvalidAlignment(usize),

    /// A region of zero bytes was requested.
    #[error("invalid region size: {0}")]
    InvalidSize(usize),

    /// No free span large enough after alignment.
    #[error("out of space: requested {requested} bytes, {available} bytes free")]
    OutOfSpace {
        /// Bytes requested (before alignment).
        requested: usize,
        /// Bytes currently free in the region.
        available: usize,
    },

    /// The segment is not owned by this allocator, or was already freed.
    #[error("invalid deallocation of [{begin:#x}, {end:#x})")]
    InvalidDeallocation {
        /// Start address of the rejected span.
        begin: usize,
        /// End address of the rejected span.
        end: usize,
    },

    /// Parent and child disagree on whether they are physically backed.
    #[error("backing mismatch: parent physically backed = {parent}, child = {child}")]
    BackingMismatch {
        /// Whether the parent is physically backed.
        parent: bool,
        /// Whether the requested child is physically backed.
        child: bool,
    },

    /// The platform refused to reserve address space.
    #[error("platform refused to reserve {size} bytes: {reason}")]
    PlatformReservation {
        /// Bytes requested from the platform.
        size: usize,
        /// Platform error text.
        reason: String,
    },

    /// The platform refused to commit, decommit or release pages.
    #[error("platform page operation failed at {base:#x} (+{size} bytes): {reason}")]
    PlatformCommit {
        /// First address of the failed operation.
        base: usize,
        /// Length of the failed operation.
        size: usize,
        /// Platform error text.
        reason: String,
    },

    /// No child region with this id exists under the region.
    #[error("unknown region: {0}")]
    UnknownRegion(RegionId),

    /// A region was destroyed while it still owned child regions.
    #[error("region {region} still owns {children} child region(s)")]
    LiveChildren {
        /// The region being destroyed.
        region: RegionId,
        /// Number of children still alive.
        children: usize,
    },

    /// A child slot no longer holds the region that was created in it.
    ///
    /// The region was moved out through a mutable borrow. Its span stays
    /// reserved in the parent for as long as the parent lives.
    #[error("child region {0} was replaced outside its parent")]
    ReplacedRegion(RegionId),

    /// A block pool would need more blocks than a slot index can address.
    #[error("block pool of {blocks} blocks exceeds the slot index range")]
    TooManyBlocks {
        /// Blocks the span would hold.
        blocks: usize,
    },

    /// Invalid configuration file.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = MemoryError::OutOfSpace {
            requested: 64,
            available: 32,
        };
        assert_eq!(err.to_string(), "out of space: requested 64 bytes, 32 bytes free");

        let err = MemoryError::InvalidDeallocation { begin: 0x10, end: 0x20 };
        assert_eq!(err.to_string(), "invalid deallocation of [0x10, 0x20)");
    }
}
