//! Allocator errors

use thiserror::Error;

/// Errors that can occur while obtaining or returning storage
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The OS (or the configured arena cap) refused a new arena
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory {
        /// Requested size in bytes
        size: usize,
    },

    /// A pointer handed to `free` does not belong to a live allocation
    #[error("invalid free of {addr:#x}")]
    InvalidFree {
        /// Address passed to `free`
        addr: usize,
    },

    /// Allocator configuration is unusable
    #[error("invalid allocator config: {0}")]
    InvalidConfig(&'static str),
}

/// Result type for allocator operations
pub type Result<T> = std::result::Result<T, AllocError>;
