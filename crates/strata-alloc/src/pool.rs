//! Pools: fixed-size runs of blocks inside an arena.
//!
//! A committed pool is dedicated to one size class until every block in it
//! is free again. Metadata is kept out of line; the pool memory holds only
//! block payloads.
//!
//! ```text
//! Pool (pool_size bytes, pool_size aligned):
//! ┌──────────────────────────────┐
//! │ Block 0: [u8; block_size]    │
//! │ Block 1: [u8; block_size]    │
//! │ ...                          │
//! │ Block K: [u8; block_size]    │
//! └──────────────────────────────┘
//!
//! free_bits: bit N = 1 means block N is free
//! ```

use std::ptr::NonNull;

use crate::error::{AllocError, Result};
use crate::size_class::size_class_block_size;

/// Out-of-line metadata for one pool.
pub(crate) struct Pool {
    /// Start of the pool's memory (inside the owning arena).
    base: NonNull<u8>,
    /// Size class while committed, `None` while on the free-pool list.
    size_class: Option<usize>,
    /// Block size in bytes for the committed size class.
    block_size: usize,
    /// Number of blocks that fit in the pool.
    num_blocks: usize,
    /// Free bitvector, stored as u64 words for `trailing_zeros()` scanning.
    free_bits: Vec<u64>,
    /// Number of blocks handed out.
    live_count: usize,
}

impl Pool {
    /// Create an uncommitted pool at `base`.
    pub(crate) fn new(base: NonNull<u8>) -> Self {
        Self {
            base,
            size_class: None,
            block_size: 0,
            num_blocks: 0,
            free_bits: Vec::new(),
            live_count: 0,
        }
    }

    /// Dedicate this pool to `size_class`. Every block starts free.
    pub(crate) fn commit(&mut self, size_class: usize, pool_size: usize) {
        debug_assert!(self.size_class.is_none(), "pool committed twice");

        let block_size = size_class_block_size(size_class);
        let num_blocks = pool_size / block_size;
        let num_words = num_blocks.div_ceil(64);
        let mut free_bits = vec![u64::MAX; num_words];
        // Mask out bits beyond num_blocks in the last word
        let remainder = num_blocks % 64;
        if remainder != 0 {
            free_bits[num_words - 1] = (1u64 << remainder) - 1;
        }

        self.size_class = Some(size_class);
        self.block_size = block_size;
        self.num_blocks = num_blocks;
        self.free_bits = free_bits;
        self.live_count = 0;
    }

    /// Return the pool to the uncommitted state.
    pub(crate) fn decommit(&mut self) {
        debug_assert_eq!(self.live_count, 0, "decommitting a pool with live blocks");
        self.size_class = None;
        self.block_size = 0;
        self.num_blocks = 0;
        self.free_bits = Vec::new();
    }

    /// Try to allocate a block. Returns `None` if the pool is full.
    pub(crate) fn allocate(&mut self) -> Option<NonNull<u8>> {
        for (word_idx, word) in self.free_bits.iter_mut().enumerate() {
            if *word == 0 {
                continue;
            }

            let bit_idx = word.trailing_zeros() as usize;
            let block_idx = word_idx * 64 + bit_idx;
            if block_idx >= self.num_blocks {
                return None;
            }

            *word &= !(1u64 << bit_idx);
            self.live_count += 1;

            // SAFETY: block_idx < num_blocks, so the offset stays inside the pool
            let ptr = unsafe { self.base.as_ptr().add(block_idx * self.block_size) };
            return NonNull::new(ptr);
        }

        None
    }

    /// Mark the block at `ptr` free again.
    pub(crate) fn free(&mut self, ptr: NonNull<u8>) -> Result<()> {
        let addr = ptr.as_ptr() as usize;
        let offset = addr
            .checked_sub(self.base.as_ptr() as usize)
            .ok_or(AllocError::InvalidFree { addr })?;
        if self.size_class.is_none() || offset % self.block_size != 0 {
            return Err(AllocError::InvalidFree { addr });
        }

        let block_idx = offset / self.block_size;
        if block_idx >= self.num_blocks {
            return Err(AllocError::InvalidFree { addr });
        }

        let word_idx = block_idx / 64;
        let bit = 1u64 << (block_idx % 64);
        if self.free_bits[word_idx] & bit != 0 {
            // Double free
            return Err(AllocError::InvalidFree { addr });
        }

        self.free_bits[word_idx] |= bit;
        self.live_count -= 1;
        Ok(())
    }

    #[inline]
    pub(crate) fn size_class(&self) -> Option<usize> {
        self.size_class
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.live_count == self.num_blocks
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.live_count == 0
    }

    #[inline]
    pub(crate) fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    #[cfg(test)]
    pub(crate) fn block_size(&self) -> usize {
        self.block_size
    }
}
