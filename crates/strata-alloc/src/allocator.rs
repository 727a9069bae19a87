//! Size-classed block allocator.
//!
//! ## Design
//!
//! - **Arenas** (256 KiB) are obtained from the system allocator and carved
//!   into **pools** (4 KiB) on demand.
//! - A pool is committed to one size class and hands out fixed-size
//!   **blocks** until it is empty again.
//! - Each size class keeps a list of partially used pools; allocation pops
//!   from it before committing another pool.
//! - Empty pools go to a shared free-pool list usable by any size class.
//! - Arenas whose pools are all unused are returned to the OS, keeping a
//!   configurable number of empty arenas as a burst buffer.
//! - Requests above [`SMALL_REQUEST_THRESHOLD`] (or over-aligned ones)
//!   bypass pooling.

use std::alloc::Layout;
use std::ptr::NonNull;

use rustc_hash::FxHashMap;

use crate::arena::Arena;
use crate::error::{AllocError, Result};
use crate::size_class::{
    ALIGNMENT, NUM_SIZE_CLASSES, SMALL_REQUEST_THRESHOLD, size_class_block_size,
    size_class_index,
};

/// Allocator configuration
#[derive(Debug, Clone)]
pub struct AllocConfig {
    /// Arena size in bytes, a power of two (default: 256 KiB)
    pub arena_size: usize,
    /// Pool size in bytes, a power of two (default: 4 KiB)
    pub pool_size: usize,
    /// Cap on live arenas; exceeding it is reported as out of memory
    pub max_arenas: Option<usize>,
    /// Empty arenas kept instead of being returned to the OS (default: 1)
    pub retained_empty_arenas: usize,
}

impl Default for AllocConfig {
    fn default() -> Self {
        Self {
            arena_size: 256 * 1024, // 256 KiB
            pool_size: 4 * 1024,    // 4 KiB
            max_arenas: None,
            retained_empty_arenas: 1,
        }
    }
}

impl AllocConfig {
    /// Check the geometry constraints the allocator relies on.
    pub fn validate(&self) -> Result<()> {
        if !self.pool_size.is_power_of_two() || !self.arena_size.is_power_of_two() {
            return Err(AllocError::InvalidConfig(
                "arena and pool sizes must be powers of two",
            ));
        }
        if self.pool_size < SMALL_REQUEST_THRESHOLD {
            return Err(AllocError::InvalidConfig(
                "pool must hold at least one block of the largest size class",
            ));
        }
        if self.arena_size < self.pool_size {
            return Err(AllocError::InvalidConfig("arena smaller than a pool"));
        }
        Ok(())
    }

    /// Set the arena cap
    pub fn with_max_arenas(mut self, max_arenas: usize) -> Self {
        self.max_arenas = Some(max_arenas);
        self
    }

    /// Set the number of retained empty arenas
    pub fn with_retained_empty_arenas(mut self, retained: usize) -> Self {
        self.retained_empty_arenas = retained;
        self
    }
}

/// Allocator statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocStats {
    /// Arenas currently held
    pub arenas_live: usize,
    /// Arenas obtained over the allocator's lifetime
    pub arenas_allocated: usize,
    /// Arenas returned to the OS
    pub arenas_released: usize,
    /// Highest number of simultaneously live arenas
    pub peak_arenas: usize,
    /// Pools committed to a size class
    pub pools_in_use: usize,
    /// Carved pools waiting on the free-pool list
    pub free_pools: usize,
    /// Blocks handed out
    pub blocks_in_use: usize,
    /// Free blocks inside committed pools
    pub free_blocks: usize,
    /// Live allocations on the large path
    pub large_allocations: usize,
    /// Bytes held by large allocations
    pub large_bytes: usize,
    /// Bytes handed out (rounded block sizes plus large bytes)
    pub bytes_in_use: usize,
}

/// Location of a pool: arena slot and pool index inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PoolId {
    arena: usize,
    pool: usize,
}

/// Arena/pool/block allocator.
///
/// Single-threaded: every method takes `&mut self` and the allocator holds
/// raw pointers, so it is neither `Send` nor `Sync`.
pub struct BlockAllocator {
    config: AllocConfig,
    /// Arena slots. Released arenas leave `None` for reuse.
    arenas: Vec<Option<Arena>>,
    /// Arena base address → slot.
    arena_index: FxHashMap<usize, usize>,
    /// Per size class: pools with at least one free block.
    partial: Vec<Vec<PoolId>>,
    /// Carved, uncommitted pools usable by any size class.
    free_pools: Vec<PoolId>,
    /// Large allocations: address → layout.
    large: FxHashMap<usize, Layout>,
    stats: AllocStats,
}

impl BlockAllocator {
    /// Create an allocator with the default configuration
    pub fn new() -> Self {
        Self::build(AllocConfig::default())
    }

    /// Create an allocator with a custom configuration
    pub fn with_config(config: AllocConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: AllocConfig) -> Self {
        Self {
            config,
            arenas: Vec::new(),
            arena_index: FxHashMap::default(),
            partial: vec![Vec::new(); NUM_SIZE_CLASSES],
            free_pools: Vec::new(),
            large: FxHashMap::default(),
            stats: AllocStats::default(),
        }
    }

    /// Get config
    pub fn config(&self) -> &AllocConfig {
        &self.config
    }

    /// Get statistics
    pub fn stats(&self) -> AllocStats {
        self.stats
    }

    /// Bytes a request of `layout` actually occupies.
    pub fn usable_size(layout: Layout) -> usize {
        match Self::small_class(layout) {
            Some(idx) => size_class_block_size(idx),
            None => layout.size(),
        }
    }

    #[inline]
    fn small_class(layout: Layout) -> Option<usize> {
        if layout.align() > ALIGNMENT {
            return None;
        }
        size_class_index(layout.size())
    }

    /// Allocate storage for `layout`.
    ///
    /// Small requests are served from the size class free lists; the
    /// returned block is at least `layout.size()` bytes and aligned to
    /// [`ALIGNMENT`]. Fails with [`AllocError::OutOfMemory`] when no arena
    /// can be obtained; nothing is left partially allocated in that case.
    pub fn allocate(&mut self, layout: Layout) -> Result<NonNull<u8>> {
        let Some(idx) = Self::small_class(layout) else {
            return self.allocate_large(layout);
        };

        loop {
            if let Some(&pid) = self.partial[idx].last() {
                let pool = self.arena_mut(pid).pool_mut(pid.pool);
                if let Some(ptr) = pool.allocate() {
                    if pool.is_full() {
                        self.partial[idx].pop();
                    }
                    self.stats.blocks_in_use += 1;
                    self.stats.free_blocks -= 1;
                    self.stats.bytes_in_use += size_class_block_size(idx);
                    return Ok(ptr);
                }
                // A full pool should never sit on the partial list
                self.partial[idx].pop();
                continue;
            }

            let pid = self.acquire_pool(layout.size())?;
            let pool_size = self.config.pool_size;
            let pool = self.arena_mut(pid).pool_mut(pid.pool);
            pool.commit(idx, pool_size);
            let num_blocks = pool.num_blocks();
            self.stats.free_blocks += num_blocks;
            self.stats.pools_in_use += 1;
            self.partial[idx].push(pid);
        }
    }

    /// Return storage obtained from [`allocate`](Self::allocate) with the same layout.
    pub fn free(&mut self, ptr: NonNull<u8>, layout: Layout) -> Result<()> {
        let Some(idx) = Self::small_class(layout) else {
            return self.free_large(ptr, layout);
        };

        let addr = ptr.as_ptr() as usize;
        let pid = self
            .locate(addr)
            .ok_or(AllocError::InvalidFree { addr })?;

        let pool = self.arena_mut(pid).pool_mut(pid.pool);
        if pool.size_class() != Some(idx) {
            return Err(AllocError::InvalidFree { addr });
        }
        let was_full = pool.is_full();
        pool.free(ptr)?;
        let now_empty = pool.is_empty();
        let num_blocks = pool.num_blocks();

        self.stats.blocks_in_use -= 1;
        self.stats.free_blocks += 1;
        self.stats.bytes_in_use -= size_class_block_size(idx);

        if now_empty {
            if let Some(pos) = self.partial[idx].iter().position(|&p| p == pid) {
                self.partial[idx].swap_remove(pos);
            }
            self.release_pool(pid, num_blocks);
        } else if was_full {
            self.partial[idx].push(pid);
        }
        Ok(())
    }

    /// Whether `ptr` lies inside a live arena or is a live large allocation.
    pub fn owns(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        self.large.contains_key(&addr) || self.locate(addr).is_some()
    }

    fn locate(&self, addr: usize) -> Option<PoolId> {
        let arena_base = addr & !(self.config.arena_size - 1);
        let &slot = self.arena_index.get(&arena_base)?;
        let arena = self.arenas[slot].as_ref()?;
        let pool = arena.pool_index(addr)?;
        Some(PoolId { arena: slot, pool })
    }

    fn arena_mut(&mut self, pid: PoolId) -> &mut Arena {
        match self.arenas[pid.arena].as_mut() {
            Some(arena) => arena,
            None => unreachable!("pool id refers to a released arena"),
        }
    }

    /// Find a pool for a new size class commitment: reuse a free pool,
    /// carve one from an existing arena, or obtain a new arena.
    fn acquire_pool(&mut self, request: usize) -> Result<PoolId> {
        if let Some(pid) = self.free_pools.pop() {
            self.arena_mut(pid).pool_reused();
            self.stats.free_pools -= 1;
            return Ok(pid);
        }

        for (slot, arena) in self.arenas.iter_mut().enumerate() {
            if let Some(arena) = arena
                && let Some(pool) = arena.carve_pool()
            {
                return Ok(PoolId { arena: slot, pool });
            }
        }

        let slot = self.new_arena(request)?;
        let pool = self.arenas[slot]
            .as_mut()
            .and_then(Arena::carve_pool)
            .ok_or(AllocError::OutOfMemory { size: request })?;
        Ok(PoolId { arena: slot, pool })
    }

    fn new_arena(&mut self, request: usize) -> Result<usize> {
        if let Some(max) = self.config.max_arenas
            && self.stats.arenas_live >= max
        {
            #[cfg(feature = "alloc_logging")]
            tracing::warn!(
                target: "strata::alloc",
                max_arenas = max,
                request,
                "arena cap reached"
            );
            return Err(AllocError::OutOfMemory { size: request });
        }

        let arena = Arena::new(self.config.arena_size, self.config.pool_size)
            .map_err(|_| AllocError::OutOfMemory { size: request })?;
        let base = arena.base_addr();

        let slot = match self.arenas.iter().position(Option::is_none) {
            Some(slot) => {
                self.arenas[slot] = Some(arena);
                slot
            }
            None => {
                self.arenas.push(Some(arena));
                self.arenas.len() - 1
            }
        };
        self.arena_index.insert(base, slot);

        self.stats.arenas_live += 1;
        self.stats.arenas_allocated += 1;
        self.stats.peak_arenas = self.stats.peak_arenas.max(self.stats.arenas_live);
        Ok(slot)
    }

    /// An emptied pool goes back to the free-pool list; its arena may go
    /// back to the OS.
    fn release_pool(&mut self, pid: PoolId, num_blocks: usize) {
        let arena = self.arena_mut(pid);
        arena.pool_mut(pid.pool).decommit();
        arena.pool_released();
        let arena_unused = arena.is_unused();

        self.free_pools.push(pid);
        self.stats.free_pools += 1;
        self.stats.pools_in_use -= 1;
        self.stats.free_blocks -= num_blocks;

        if arena_unused {
            self.maybe_release_arena(pid.arena);
        }
    }

    fn maybe_release_arena(&mut self, slot: usize) {
        let empty_arenas = self
            .arenas
            .iter()
            .flatten()
            .filter(|arena| arena.is_unused())
            .count();
        if empty_arenas <= self.config.retained_empty_arenas {
            return;
        }

        let Some(arena) = self.arenas[slot].take() else {
            return;
        };
        let before = self.free_pools.len();
        self.free_pools.retain(|pid| pid.arena != slot);
        self.stats.free_pools -= before - self.free_pools.len();
        self.arena_index.remove(&arena.base_addr());
        self.stats.arenas_live -= 1;
        self.stats.arenas_released += 1;
        drop(arena);
    }

    fn allocate_large(&mut self, layout: Layout) -> Result<NonNull<u8>> {
        let layout = layout
            .align_to(ALIGNMENT)
            .map_err(|_| AllocError::OutOfMemory {
                size: layout.size(),
            })?;
        if layout.size() == 0 {
            return Err(AllocError::InvalidConfig("zero-sized large allocation"));
        }

        // SAFETY: layout has non-zero size
        let raw = unsafe { std::alloc::alloc(layout) };
        let ptr = NonNull::new(raw).ok_or(AllocError::OutOfMemory {
            size: layout.size(),
        })?;

        self.large.insert(raw as usize, layout);
        self.stats.large_allocations += 1;
        self.stats.large_bytes += layout.size();
        self.stats.bytes_in_use += layout.size();
        Ok(ptr)
    }

    fn free_large(&mut self, ptr: NonNull<u8>, _layout: Layout) -> Result<()> {
        let addr = ptr.as_ptr() as usize;
        let layout = self
            .large
            .remove(&addr)
            .ok_or(AllocError::InvalidFree { addr })?;

        // SAFETY: ptr was returned by std::alloc::alloc with this layout
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };

        self.stats.large_allocations -= 1;
        self.stats.large_bytes -= layout.size();
        self.stats.bytes_in_use -= layout.size();
        Ok(())
    }
}

impl Default for BlockAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BlockAllocator {
    fn drop(&mut self) {
        for (&addr, &layout) in &self.large {
            // SAFETY: every entry was produced by std::alloc::alloc with this layout
            unsafe { std::alloc::dealloc(addr as *mut u8, layout) };
        }
        // Arenas release themselves
    }
}

impl std::fmt::Debug for BlockAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockAllocator")
            .field("stats", &self.stats)
            .finish()
    }
}
