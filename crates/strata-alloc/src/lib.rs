//! # Strata block allocator
//!
//! Non-moving small-object allocator backing the strata managed heap.
//!
//! ## Design
//!
//! - **Arena**: large region obtained from the OS, aligned to its own size
//! - **Pool**: fixed-size slice of an arena, dedicated to one size class
//!   while it has live blocks
//! - **Block**: one allocation slot
//! - **Large objects**: requests above 512 bytes go to the system allocator
//!
//! Freed blocks are reused before new pools are committed, and arenas are
//! returned to the OS lazily, so addresses of live blocks never move.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod allocator;
mod arena;
pub mod error;
mod pool;
pub mod size_class;

pub use allocator::{AllocConfig, AllocStats, BlockAllocator};
pub use error::{AllocError, Result};
pub use size_class::{ALIGNMENT, NUM_SIZE_CLASSES, SMALL_REQUEST_THRESHOLD};
