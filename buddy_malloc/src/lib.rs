//! A user-space general-purpose allocator: a binary buddy allocator over a
//! preallocated arena, with an independent `mmap` path for requests too large
//! for the arena to ever satisfy.
//!
//! ```
//! use buddy_malloc::Allocator;
//!
//! let mut allocator = Allocator::new();
//! let ptr = allocator.allocate(64);
//! assert!(!ptr.is_null());
//! unsafe { allocator.free(ptr) };
//! ```

mod config;
mod engine;
mod header;
mod order;

pub use config::{AllocError, Config};
pub use engine::Allocator;
