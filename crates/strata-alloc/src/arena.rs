//! Arenas: large OS-obtained regions carved into pools.
//!
//! An arena is aligned to its own size, so the arena owning any block is
//! found by masking the block address.

use std::alloc::Layout;
use std::ptr::NonNull;

use crate::error::{AllocError, Result};
use crate::pool::Pool;

pub(crate) struct Arena {
    base: NonNull<u8>,
    layout: Layout,
    pool_size: usize,
    /// Pools carved so far; pool `i` starts at `base + i * pool_size`.
    pools: Vec<Pool>,
    /// Carved pools currently uncommitted.
    free_pools: usize,
}

impl Arena {
    /// Obtain a new arena from the system allocator.
    pub(crate) fn new(arena_size: usize, pool_size: usize) -> Result<Self> {
        let layout = Layout::from_size_align(arena_size, arena_size)
            .map_err(|_| AllocError::InvalidConfig("arena size must be a power of two"))?;

        // SAFETY: layout has non-zero size (validated by AllocConfig)
        let raw = unsafe { std::alloc::alloc(layout) };
        let base = NonNull::new(raw).ok_or(AllocError::OutOfMemory { size: arena_size })?;

        #[cfg(feature = "alloc_logging")]
        tracing::debug!(
            target: "strata::alloc",
            base = base.as_ptr() as usize,
            arena_size,
            "arena acquired"
        );

        Ok(Self {
            base,
            layout,
            pool_size,
            pools: Vec::with_capacity(arena_size / pool_size),
            free_pools: 0,
        })
    }

    #[inline]
    pub(crate) fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Whether another pool can be carved out of untouched arena space.
    #[inline]
    pub(crate) fn can_carve(&self) -> bool {
        self.pools.len() < self.layout.size() / self.pool_size
    }

    /// Carve a fresh pool. Returns its index within the arena.
    pub(crate) fn carve_pool(&mut self) -> Option<usize> {
        if !self.can_carve() {
            return None;
        }
        let index = self.pools.len();
        // SAFETY: index * pool_size < arena size (checked by can_carve)
        let base = unsafe { self.base.as_ptr().add(index * self.pool_size) };
        self.pools.push(Pool::new(NonNull::new(base)?));
        Some(index)
    }

    /// Index of the pool holding `addr`, if it has been carved.
    #[inline]
    pub(crate) fn pool_index(&self, addr: usize) -> Option<usize> {
        let index = addr.checked_sub(self.base_addr())? / self.pool_size;
        (index < self.pools.len()).then_some(index)
    }

    #[inline]
    pub(crate) fn pool_mut(&mut self, index: usize) -> &mut Pool {
        &mut self.pools[index]
    }

    pub(crate) fn pool_released(&mut self) {
        self.free_pools += 1;
    }

    pub(crate) fn pool_reused(&mut self) {
        self.free_pools -= 1;
    }

    /// True when no carved pool is committed to a size class.
    #[inline]
    pub(crate) fn is_unused(&self) -> bool {
        self.free_pools == self.pools.len()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        #[cfg(feature = "alloc_logging")]
        tracing::debug!(
            target: "strata::alloc",
            base = self.base_addr(),
            "arena released"
        );

        // SAFETY: base was obtained from std::alloc::alloc with this layout
        unsafe { std::alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}
