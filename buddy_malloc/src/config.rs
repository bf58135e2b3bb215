use std::io;

use thiserror::Error;

/// Errors at the edges of the allocator that aren't part of the NULL-returning
/// `allocate`/`free`/`zalloc`/`resize` contract: building an internally
/// inconsistent [`Config`], or the OS declining to hand over a mapping.
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("invalid allocator configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("failed to create anonymous mapping: {0}")]
    MapFailed(#[source] io::Error),
}

/// Tunable constants governing arena sizing and request limits.
///
/// `Config::default()` reproduces the fixed constants of the original
/// allocator exactly: 128-byte base blocks, 11 orders (0..=10), a 32-block
/// arena, and a 10^8-byte request cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub base_block_size: usize,
    pub max_order: usize,
    pub arena_blocks: usize,
    pub max_request: usize,
}

impl Config {
    pub fn new(
        base_block_size: usize,
        max_order: usize,
        arena_blocks: usize,
        max_request: usize,
    ) -> Result<Config, AllocError> {
        if !base_block_size.is_power_of_two() {
            return Err(AllocError::InvalidConfig("base_block_size must be a power of two"));
        }
        if max_order > 31 {
            return Err(AllocError::InvalidConfig("max_order must be at most 31"));
        }
        if arena_blocks == 0 {
            return Err(AllocError::InvalidConfig("arena_blocks must be non-zero"));
        }
        if max_request == 0 {
            return Err(AllocError::InvalidConfig("max_request must be non-zero"));
        }
        if base_block_size.checked_shl(max_order as u32).is_none() {
            return Err(AllocError::InvalidConfig("base_block_size << max_order overflows usize"));
        }
        Ok(Config { base_block_size, max_order, arena_blocks, max_request })
    }

    /// Requests whose total size (payload + header) exceeds this are routed to
    /// the mmap path instead of the buddy arena.
    pub fn mmap_threshold(&self) -> usize {
        self.base_block_size << self.max_order
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new(128, 10, 32, 100_000_000).expect("the default configuration is always valid")
    }
}
