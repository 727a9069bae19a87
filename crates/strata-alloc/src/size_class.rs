//! Size-class ladder.
//!
//! Small requests are rounded up to a multiple of [`ALIGNMENT`]. Everything
//! above [`SMALL_REQUEST_THRESHOLD`] bypasses pooling.

/// Granularity of the ladder and the alignment every block is guaranteed.
pub const ALIGNMENT: usize = 16;

/// Largest request served from pools.
pub const SMALL_REQUEST_THRESHOLD: usize = 512;

/// Number of size classes.
pub const NUM_SIZE_CLASSES: usize = SMALL_REQUEST_THRESHOLD / ALIGNMENT;

/// Find the size class index for a given allocation size.
/// Returns `None` if the size exceeds the largest size class (large object).
#[inline]
pub fn size_class_index(size: usize) -> Option<usize> {
    if size > SMALL_REQUEST_THRESHOLD {
        return None;
    }
    Some(size.max(1).div_ceil(ALIGNMENT) - 1)
}

/// Get the block size for a given size class index.
#[inline]
pub fn size_class_block_size(index: usize) -> usize {
    (index + 1) * ALIGNMENT
}
