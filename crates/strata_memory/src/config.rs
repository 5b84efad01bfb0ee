//! # Region Configuration
//!
//! Regions can be described in TOML and built with
//! [`MemoryRegion::from_config`]:
//!
//! ```toml
//! size = 1048576
//! alignment = 16
//! physically_backed = true
//! compaction = "best_fit"
//!
//! [allocator]
//! kind = "block"
//! block_size = 256
//! ```
//!
//! [`MemoryRegion::from_config`]: crate::memory::MemoryRegion::from_config

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{MemoryError, MemoryResult};
use crate::memory::{Allocator, Backing, BlockAllocator, CompactionPolicy, FreeListAllocator};

fn default_alignment() -> usize {
    1
}

fn default_physically_backed() -> bool {
    true
}

/// Allocation policy of a configured region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AllocatorConfig {
    /// Variable-size first-fit allocator.
    #[default]
    FreeList,
    /// Fixed-size block pool.
    Block {
        /// Size of every block in bytes.
        block_size: usize,
    },
}

/// Description of a root memory region.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegionConfig {
    /// Requested size in bytes.
    pub size: usize,
    /// Default allocation alignment.
    #[serde(default = "default_alignment")]
    pub alignment: usize,
    /// Whether the region reserves real memory.
    #[serde(default = "default_physically_backed")]
    pub physically_backed: bool,
    /// Allocation policy.
    #[serde(default)]
    pub allocator: AllocatorConfig,
    /// Compaction policy (free-list allocators only).
    #[serde(default)]
    pub compaction: CompactionPolicy,
}

impl RegionConfig {
    /// Physically backed free-list region with default alignment.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            size,
            alignment: default_alignment(),
            physically_backed: default_physically_backed(),
            allocator: AllocatorConfig::default(),
            compaction: CompactionPolicy::default(),
        }
    }

    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidConfig`] on malformed TOML or invalid
    /// values.
    pub fn from_toml_str(source: &str) -> MemoryResult<Self> {
        let config: Self = toml::from_str(source).map_err(|e| MemoryError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidConfig`] if the file cannot be read or
    /// is invalid.
    pub fn from_path(path: impl AsRef<Path>) -> MemoryResult<Self> {
        let path = path.as_ref();
        let source = fs::read_to_string(path)
            .map_err(|e| MemoryError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }

    /// Checks the values for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidConfig`] for a zero size or alignment,
    /// or a block size of zero or larger than the region.
    pub fn validate(&self) -> MemoryResult<()> {
        if self.size == 0 {
            return Err(MemoryError::InvalidConfig("Region size must be greater than zero".to_string()));
        }
        if self.alignment == 0 {
            return Err(MemoryError::InvalidConfig(
                "Region alignment must be greater than zero".to_string(),
            ));
        }
        if let AllocatorConfig::Block { block_size } = self.allocator {
            if block_size == 0 || block_size > self.size {
                return Err(MemoryError::InvalidConfig(format!(
                    "Block size {block_size} must be in 1..={}",
                    self.size
                )));
            }
        }
        Ok(())
    }

    /// Backing derived from `physically_backed`.
    #[must_use]
    pub fn backing(&self) -> Backing {
        Backing::from(self.physically_backed)
    }

    /// Builds the configured, not yet bound, allocator.
    #[must_use]
    pub fn build_allocator(&self) -> Box<dyn Allocator> {
        match self.allocator {
            AllocatorConfig::FreeList => {
                Box::new(FreeListAllocator::new(self.backing()).with_policy(self.compaction))
            }
            AllocatorConfig::Block { block_size } => Box::new(BlockAllocator::new(block_size, self.backing())),
        }
    }
}
