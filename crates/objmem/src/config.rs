//! Heap configuration.

use std::path::PathBuf;

use crate::error::MemoryError;
use crate::object::{MAXIMUM_OBJECT_SIZE, MINIMUM_OBJECT_SIZE, OBJECT_GRAIN};

/// Default size of a normal-space segment.
pub const DEFAULT_SEGMENT_SIZE: usize = 64 * 1024;
/// Default size of a large-space segment.
pub const DEFAULT_LARGE_SEGMENT_SIZE: usize = 1024 * 1024;
/// Objects above this size go to large space.
pub const DEFAULT_LARGE_BLOCK_THRESHOLD: usize = 4096;

/// Sizes and limits for a [`Memory`](crate::Memory).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Size of each normal-space segment. Must be a multiple of the object
    /// grain and hold at least one large-threshold object.
    pub segment_size: usize,
    /// Size of each large-space segment. Bigger objects get a segment of
    /// their own.
    pub large_segment_size: usize,
    /// Bytes reserved from the OS per pool.
    pub pool_size: usize,
    /// Upper bound on bytes reserved across all pools.
    pub heap_limit: usize,
    /// Largest object allocated in normal space.
    pub large_block_threshold: usize,
    /// Initial live stack capacity, in entries.
    pub live_stack_size: usize,
    /// Number of recently held objects kept alive by the save stack.
    pub save_stack_size: usize,
    /// Hard maximum for an image or flatten buffer.
    pub max_image_size: usize,
    /// Initial capacity of the identity tables.
    pub identity_table_size: usize,
    /// Image restored by [`Memory::initialize`](crate::Memory::initialize)
    /// when restoring.
    pub image_path: Option<PathBuf>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            large_segment_size: DEFAULT_LARGE_SEGMENT_SIZE,
            pool_size: 16 * 1024 * 1024,
            heap_limit: 1024 * 1024 * 1024,
            large_block_threshold: DEFAULT_LARGE_BLOCK_THRESHOLD,
            live_stack_size: 4096,
            save_stack_size: 32,
            max_image_size: 256 * 1024 * 1024,
            identity_table_size: 1000,
            image_path: None,
        }
    }
}

impl MemoryConfig {
    /// A small heap for tests: 16KB segments in 1MB pools.
    #[cfg(any(test, feature = "test-util"))]
    #[must_use]
    pub fn small() -> Self {
        Self {
            segment_size: 16 * 1024,
            large_segment_size: 64 * 1024,
            pool_size: 1024 * 1024,
            heap_limit: 64 * 1024 * 1024,
            large_block_threshold: 1024,
            live_stack_size: 16,
            save_stack_size: 4,
            max_image_size: 4 * 1024 * 1024,
            identity_table_size: 16,
            image_path: None,
        }
    }

    /// Checks the settings against each other.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::Config`] naming the first bad setting.
    pub fn validate(&self) -> Result<(), MemoryError> {
        fn fail(msg: impl Into<String>) -> Result<(), MemoryError> {
            Err(MemoryError::Config(msg.into()))
        }

        if self.large_block_threshold < MINIMUM_OBJECT_SIZE
            || self.large_block_threshold % OBJECT_GRAIN != 0
        {
            return fail(format!(
                "large_block_threshold must be a multiple of {OBJECT_GRAIN} and at least {MINIMUM_OBJECT_SIZE}"
            ));
        }
        if self.segment_size % OBJECT_GRAIN != 0 || self.segment_size < self.large_block_threshold {
            return fail(format!(
                "segment_size must be a multiple of {OBJECT_GRAIN} and at least large_block_threshold"
            ));
        }
        if self.large_segment_size % OBJECT_GRAIN != 0
            || self.large_segment_size <= self.large_block_threshold
        {
            return fail("large_segment_size must be grain aligned and exceed large_block_threshold");
        }
        if self.pool_size < self.segment_size {
            return fail("pool_size must hold at least one segment");
        }
        if self.heap_limit < self.pool_size {
            return fail("heap_limit must allow at least one pool");
        }
        if self.live_stack_size == 0 {
            return fail("live_stack_size must be greater than 0");
        }
        if self.max_image_size < MINIMUM_OBJECT_SIZE || self.max_image_size > MAXIMUM_OBJECT_SIZE {
            return fail("max_image_size must fit in a single object");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        MemoryConfig::default().validate().unwrap();
        MemoryConfig::small().validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_threshold() {
        let config = MemoryConfig {
            large_block_threshold: 100,
            ..MemoryConfig::default()
        };
        assert!(matches!(config.validate(), Err(MemoryError::Config(_))));
    }

    #[test]
    fn test_rejects_small_segment() {
        let config = MemoryConfig {
            segment_size: 1024,
            ..MemoryConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_stack() {
        let config = MemoryConfig {
            live_stack_size: 0,
            ..MemoryConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
