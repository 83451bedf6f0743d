//! Block pool: a size-class arena with an eviction-managed free-block cache.
//!
//! The pool manages a sorted sequence of byte blocks carved from one
//! initial region. Allocation is first-fit with splitting, deallocation
//! coalesces free neighbors, and freed blocks are published to a
//! [`BlockCache`](crate::cache::BlockCache) so repeat allocations of the
//! same size skip the scan entirely. An allocation-frequency histogram
//! feeds the explicit cache-warmup strategies.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::time::Instant;
use thiserror::Error;

use crate::cache::{BlockCache, CacheEntry, EvictionPolicy};

/// Errors produced by the block pool.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Requested or configured size is invalid.
    #[error("invalid pool size")]
    InvalidSize,

    /// No free block can satisfy the request.
    #[error("allocation failed")]
    AllocationFailed,

    /// The handle does not name a block in this pool.
    #[error("invalid block handle")]
    InvalidBlock,

    /// The block is not currently allocated.
    #[error("block is not allocated")]
    BlockNotAllocated,
}

/// Stable handle to a block in the pool.
///
/// Handles stay valid until the block is consumed by coalescing; a stale
/// handle is rejected with [`PoolError::InvalidBlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(u64);

impl BlockId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw handle value.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Metadata carried by every block.
#[derive(Debug, Clone, Copy)]
pub struct BlockHeader {
    /// Size of the block in bytes.
    pub size: u64,
    /// Whether the block is currently allocated.
    pub is_allocated: bool,
    /// When the block was created.
    pub created_at: Instant,
    /// When the block was last allocated or freed.
    pub last_accessed: Instant,
}

/// A block of memory in the pool's sequence.
#[derive(Debug)]
struct MemBlock {
    id: BlockId,
    header: BlockHeader,
    data: Vec<u8>,
}

impl MemBlock {
    fn new(id: BlockId, size: u64) -> Self {
        let now = Instant::now();
        #[allow(clippy::cast_possible_truncation)]
        let data = vec![0u8; size as usize];
        Self {
            id,
            header: BlockHeader {
                size,
                is_allocated: false,
                created_at: now,
                last_accessed: now,
            },
            data,
        }
    }
}

/// Configuration for a [`BlockPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Total bytes managed by the pool.
    pub initial_size: u64,
    /// Minimum useful block size; split remainders below it are not split.
    pub min_block_size: u64,
    /// Maximum allocatable block size.
    pub max_block_size: u64,
    /// Cache capacity in bytes. Zero disables the cache.
    pub cache_capacity: u64,
    /// Cache eviction policy.
    pub eviction_policy: EvictionPolicy,
}

/// Cache warmup strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmupStrategy {
    /// Publish every free block, relying on the allocation histogram
    /// having shaped the free list.
    Frequency,
    /// Publish only free blocks in `[min_block_size, max_block_size / 2]`.
    Size,
    /// Frequency first, then Size while the cache has room.
    Hybrid,
}

/// Pool usage counters, returned by value.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolMetrics {
    /// Total bytes managed.
    pub total_size: u64,
    /// Bytes in allocated blocks.
    pub used_size: u64,
    /// Bytes in free blocks.
    pub available_size: u64,
    /// Allocations served.
    pub allocations: u64,
    /// Deallocations performed.
    pub deallocations: u64,
}

/// Block-count summary used to judge fragmentation.
#[derive(Debug, Clone, Copy)]
pub struct FragmentationInfo {
    /// Total blocks in the sequence.
    pub blocks: usize,
    /// Free blocks.
    pub free_blocks: usize,
    /// Size of the largest free block.
    pub largest_free: u64,
}

#[derive(Debug)]
struct PoolState {
    /// Blocks in address order; neighbors in the vector are neighbors in
    /// the managed region.
    blocks: Vec<MemBlock>,
    next_id: u64,
    /// Allocation-size histogram for warmup.
    frequency: FxHashMap<u64, u64>,
    metrics: PoolMetrics,
}

impl PoolState {
    fn mint_id(&mut self) -> BlockId {
        let id = BlockId(self.next_id);
        self.next_id += 1;
        id
    }

    fn position(&self, id: BlockId) -> Option<usize> {
        self.blocks.iter().position(|b| b.id == id)
    }

    fn refresh_usage(&mut self) {
        let used: u64 = self
            .blocks
            .iter()
            .filter(|b| b.header.is_allocated)
            .map(|b| b.header.size)
            .sum();
        self.metrics.used_size = used;
        self.metrics.available_size = self.metrics.total_size - used;
    }

    /// Merges `blocks[at + 1]` into `blocks[at]`, preserving both data
    /// regions. Both must be free.
    fn merge_with_next(&mut self, at: usize) {
        let next = self.blocks.remove(at + 1);
        let current = &mut self.blocks[at];
        current.header.size += next.header.size;
        current.data.extend_from_slice(&next.data);
    }
}

/// Size-class arena with first-fit allocation and an LRU-family cache.
#[derive(Debug)]
pub struct BlockPool {
    state: RwLock<PoolState>,
    cache: Option<BlockCache>,
    min_block_size: u64,
    max_block_size: u64,
    cache_capacity: u64,
}

impl BlockPool {
    /// Creates a pool from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidSize`] when any size option is zero or
    /// the size range is inverted.
    pub fn new(config: &PoolConfig) -> Result<Self, PoolError> {
        if config.initial_size == 0 || config.min_block_size == 0 || config.max_block_size == 0 {
            return Err(PoolError::InvalidSize);
        }
        if config.min_block_size > config.max_block_size {
            return Err(PoolError::InvalidSize);
        }

        let mut state = PoolState {
            blocks: Vec::new(),
            next_id: 0,
            frequency: FxHashMap::default(),
            metrics: PoolMetrics {
                total_size: config.initial_size,
                available_size: config.initial_size,
                ..PoolMetrics::default()
            },
        };
        let id = state.mint_id();
        state.blocks.push(MemBlock::new(id, config.initial_size));

        let cache = (config.cache_capacity > 0).then(|| {
            BlockCache::new(
                config.cache_capacity,
                config.eviction_policy,
                config.min_block_size,
                config.max_block_size,
            )
        });

        Ok(Self {
            state: RwLock::new(state),
            cache,
            min_block_size: config.min_block_size,
            max_block_size: config.max_block_size,
            cache_capacity: config.cache_capacity,
        })
    }

    /// Allocates a block of exactly `size` bytes.
    ///
    /// The request is recorded in the warmup histogram, then served from
    /// the cache when a block of the same size is available, falling back
    /// to a first-fit scan with splitting.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidSize`] for zero or over-limit sizes and
    /// [`PoolError::AllocationFailed`] when no free block fits.
    pub fn alloc(&self, size: u64) -> Result<BlockId, PoolError> {
        if size == 0 || size > self.max_block_size {
            return Err(PoolError::InvalidSize);
        }

        let mut state = self.state.write();
        *state.frequency.entry(size).or_insert(0) += 1;

        // Cache first: a hit hands back a free block of this exact size.
        if let Some(cache) = &self.cache {
            if let Some(entry) = cache.get(&Self::cache_key(size)) {
                if let Some(at) = state.position(entry.block) {
                    let block = &mut state.blocks[at];
                    if !block.header.is_allocated && block.header.size == size {
                        block.header.is_allocated = true;
                        block.header.last_accessed = Instant::now();
                        let id = block.id;
                        state.metrics.allocations += 1;
                        state.refresh_usage();
                        cache.remove(&Self::cache_key(size));
                        return Ok(id);
                    }
                }
                // Stale entry: the block was merged away or reused.
                cache.remove(&Self::cache_key(size));
            }
        }

        // First-fit scan.
        let mut found = None;
        for (at, block) in state.blocks.iter().enumerate() {
            if !block.header.is_allocated && block.header.size >= size {
                found = Some(at);
                break;
            }
        }
        let Some(at) = found else {
            return Err(PoolError::AllocationFailed);
        };

        let remainder = state.blocks[at].header.size - size;
        if remainder < self.min_block_size {
            // Too small to split usefully; hand out the whole block.
            let block = &mut state.blocks[at];
            block.header.is_allocated = true;
            block.header.last_accessed = Instant::now();
            let id = block.id;
            state.metrics.allocations += 1;
            state.refresh_usage();
            return Ok(id);
        }

        // Split: shrink in place, insert the remainder after it.
        let block = &mut state.blocks[at];
        block.header.size = size;
        block.header.is_allocated = true;
        block.header.last_accessed = Instant::now();
        #[allow(clippy::cast_possible_truncation)]
        block.data.truncate(size as usize);
        let id = block.id;

        let new_id = state.mint_id();
        let new_block = MemBlock::new(new_id, remainder);
        state.blocks.insert(at + 1, new_block);

        state.metrics.allocations += 1;
        state.refresh_usage();

        if let Some(cache) = &self.cache {
            cache.put(
                &Self::cache_key(remainder),
                CacheEntry {
                    block: new_id,
                    size: remainder,
                },
            );
        }

        Ok(id)
    }

    /// Frees a block, coalescing it with free neighbors.
    ///
    /// The (possibly merged) block is published to the cache for reuse.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidBlock`] for unknown handles and
    /// [`PoolError::BlockNotAllocated`] for double frees.
    pub fn free(&self, id: BlockId) -> Result<(), PoolError> {
        let mut state = self.state.write();

        let Some(mut at) = state.position(id) else {
            return Err(PoolError::InvalidBlock);
        };
        if !state.blocks[at].header.is_allocated {
            return Err(PoolError::BlockNotAllocated);
        }

        {
            let block = &mut state.blocks[at];
            block.header.is_allocated = false;
            block.header.last_accessed = Instant::now();
        }

        // Merge with the left neighbor, then the right.
        if at > 0 && !state.blocks[at - 1].header.is_allocated {
            at -= 1;
            state.merge_with_next(at);
        }
        if at + 1 < state.blocks.len() && !state.blocks[at + 1].header.is_allocated {
            state.merge_with_next(at);
        }

        state.metrics.deallocations += 1;
        state.refresh_usage();

        if let Some(cache) = &self.cache {
            let block = &state.blocks[at];
            cache.put(
                &Self::cache_key(block.header.size),
                CacheEntry {
                    block: block.id,
                    size: block.header.size,
                },
            );
        }

        Ok(())
    }

    /// One linear pass merging every adjacent free pair.
    pub fn defrag(&self) {
        let mut state = self.state.write();

        let mut at = 0;
        while at + 1 < state.blocks.len() {
            if !state.blocks[at].header.is_allocated && !state.blocks[at + 1].header.is_allocated {
                state.merge_with_next(at);
            } else {
                at += 1;
            }
        }
        state.refresh_usage();
    }

    /// Runs a value with read access to a block's data.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidBlock`] for unknown handles and
    /// [`PoolError::BlockNotAllocated`] for free blocks.
    pub fn with_data<R>(&self, id: BlockId, f: impl FnOnce(&[u8]) -> R) -> Result<R, PoolError> {
        let state = self.state.read();
        let at = state.position(id).ok_or(PoolError::InvalidBlock)?;
        let block = &state.blocks[at];
        if !block.header.is_allocated {
            return Err(PoolError::BlockNotAllocated);
        }
        Ok(f(&block.data))
    }

    /// Runs a value with write access to a block's data.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidBlock`] for unknown handles and
    /// [`PoolError::BlockNotAllocated`] for free blocks.
    pub fn with_data_mut<R>(
        &self,
        id: BlockId,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, PoolError> {
        let mut state = self.state.write();
        let at = state.position(id).ok_or(PoolError::InvalidBlock)?;
        let block = &mut state.blocks[at];
        if !block.header.is_allocated {
            return Err(PoolError::BlockNotAllocated);
        }
        Ok(f(&mut block.data))
    }

    /// Returns a block's header.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidBlock`] for unknown handles.
    pub fn header(&self, id: BlockId) -> Result<BlockHeader, PoolError> {
        let state = self.state.read();
        let at = state.position(id).ok_or(PoolError::InvalidBlock)?;
        Ok(state.blocks[at].header)
    }

    /// Block-count summary for fragmentation decisions.
    #[must_use]
    pub fn fragmentation_info(&self) -> FragmentationInfo {
        let state = self.state.read();
        let mut free_blocks = 0;
        let mut largest_free = 0;
        for block in &state.blocks {
            if !block.header.is_allocated {
                free_blocks += 1;
                largest_free = largest_free.max(block.header.size);
            }
        }
        FragmentationInfo {
            blocks: state.blocks.len(),
            free_blocks,
            largest_free,
        }
    }

    /// Pre-populates the cache with free blocks.
    pub fn warm_cache(&self, strategy: WarmupStrategy) {
        let Some(cache) = &self.cache else {
            return;
        };
        let state = self.state.read();

        match strategy {
            WarmupStrategy::Frequency => Self::warm_all_free(cache, &state),
            WarmupStrategy::Size => {
                self.warm_size_range(cache, &state);
            }
            WarmupStrategy::Hybrid => {
                Self::warm_all_free(cache, &state);
                if cache.cached_bytes() < self.cache_capacity {
                    self.warm_size_range(cache, &state);
                }
            }
        }
    }

    /// Frequency warmup: every free block. The allocation histogram has
    /// already shaped the free list toward popular sizes.
    fn warm_all_free(cache: &BlockCache, state: &PoolState) {
        for block in &state.blocks {
            if !block.header.is_allocated {
                cache.put(
                    &Self::cache_key(block.header.size),
                    CacheEntry {
                        block: block.id,
                        size: block.header.size,
                    },
                );
            }
        }
    }

    /// Size warmup: free blocks in `[min_block_size, max_block_size / 2]`.
    fn warm_size_range(&self, cache: &BlockCache, state: &PoolState) {
        let max = self.max_block_size / 2;
        for block in &state.blocks {
            if !block.header.is_allocated
                && block.header.size >= self.min_block_size
                && block.header.size <= max
            {
                cache.put(
                    &Self::cache_key(block.header.size),
                    CacheEntry {
                        block: block.id,
                        size: block.header.size,
                    },
                );
            }
        }
    }

    /// Times a size was requested, from the warmup histogram.
    #[must_use]
    pub fn allocation_frequency(&self, size: u64) -> u64 {
        self.state
            .read()
            .frequency
            .get(&size)
            .copied()
            .unwrap_or(0)
    }

    /// Returns a copy of the pool usage counters.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        self.state.read().metrics
    }

    /// Resets the allocation/deallocation counters.
    pub fn reset_metrics(&self) {
        let mut state = self.state.write();
        state.metrics.allocations = 0;
        state.metrics.deallocations = 0;
    }

    /// Returns a copy of the cache metrics, if a cache is configured.
    #[must_use]
    pub fn cache_metrics(&self) -> Option<crate::cache::CacheMetrics> {
        self.cache.as_ref().map(BlockCache::metrics)
    }

    /// Cache hit rate as a percentage, 0 when no cache is configured.
    #[must_use]
    pub fn cache_efficiency(&self) -> f64 {
        self.cache
            .as_ref()
            .map_or(0.0, |c| c.metrics().hit_rate * 100.0)
    }

    fn cache_key(size: u64) -> String {
        format!("size_{size}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PoolConfig {
        PoolConfig {
            initial_size: 1024,
            min_block_size: 16,
            max_block_size: 512,
            cache_capacity: 512,
            eviction_policy: EvictionPolicy::Hybrid,
        }
    }

    #[test]
    fn test_new_rejects_bad_sizes() {
        let mut bad = config();
        bad.initial_size = 0;
        assert_eq!(BlockPool::new(&bad).unwrap_err(), PoolError::InvalidSize);

        let mut bad = config();
        bad.min_block_size = 600;
        assert_eq!(BlockPool::new(&bad).unwrap_err(), PoolError::InvalidSize);
    }

    #[test]
    fn test_alloc_validates_size() {
        let pool = BlockPool::new(&config()).unwrap();
        assert_eq!(pool.alloc(0).unwrap_err(), PoolError::InvalidSize);
        assert_eq!(pool.alloc(513).unwrap_err(), PoolError::InvalidSize);
    }

    #[test]
    fn test_alloc_splits_and_reads_back() {
        let pool = BlockPool::new(&config()).unwrap();

        let a = pool.alloc(100).unwrap();
        assert_eq!(pool.header(a).unwrap().size, 100);
        assert!(pool.header(a).unwrap().is_allocated);

        // The remainder became its own free block.
        let info = pool.fragmentation_info();
        assert_eq!(info.blocks, 2);
        assert_eq!(info.free_blocks, 1);
        assert_eq!(info.largest_free, 924);

        pool.with_data_mut(a, |data| data[0] = 7).unwrap();
        assert_eq!(pool.with_data(a, |data| data[0]).unwrap(), 7);
    }

    #[test]
    fn test_alloc_whole_block_when_remainder_too_small() {
        let pool = BlockPool::new(&PoolConfig {
            initial_size: 110,
            min_block_size: 16,
            max_block_size: 110,
            cache_capacity: 0,
            eviction_policy: EvictionPolicy::Lru,
        })
        .unwrap();

        // Remainder would be 10 < min_block_size, so the whole block goes.
        let a = pool.alloc(100).unwrap();
        assert_eq!(pool.header(a).unwrap().size, 110);
        assert_eq!(pool.fragmentation_info().blocks, 1);
    }

    #[test]
    fn test_alloc_exhaustion() {
        let pool = BlockPool::new(&PoolConfig {
            initial_size: 64,
            min_block_size: 16,
            max_block_size: 64,
            cache_capacity: 0,
            eviction_policy: EvictionPolicy::Lru,
        })
        .unwrap();

        let _a = pool.alloc(64).unwrap();
        assert_eq!(pool.alloc(32).unwrap_err(), PoolError::AllocationFailed);
    }

    #[test]
    fn test_free_coalesces_neighbors() {
        let pool = BlockPool::new(&config()).unwrap();

        let a = pool.alloc(100).unwrap();
        let b = pool.alloc(100).unwrap();
        let c = pool.alloc(100).unwrap();

        pool.free(a).unwrap();
        pool.free(c).unwrap();
        // a | b | c-merged-with-tail: freeing b must fuse everything.
        pool.free(b).unwrap();

        let info = pool.fragmentation_info();
        assert_eq!(info.blocks, 1);
        assert_eq!(info.free_blocks, 1);
        assert_eq!(info.largest_free, 1024);
    }

    #[test]
    fn test_free_rejects_unknown_and_double() {
        let pool = BlockPool::new(&config()).unwrap();
        let a = pool.alloc(100).unwrap();

        assert_eq!(
            pool.free(BlockId::from_raw(999)).unwrap_err(),
            PoolError::InvalidBlock
        );

        pool.free(a).unwrap();
        // After coalescing the handle is gone entirely.
        assert!(matches!(
            pool.free(a),
            Err(PoolError::InvalidBlock | PoolError::BlockNotAllocated)
        ));
    }

    #[test]
    fn test_defrag_leaves_no_adjacent_free_pairs() {
        let pool = BlockPool::new(&config()).unwrap();

        let mut ids = Vec::new();
        for _ in 0..6 {
            ids.push(pool.alloc(100).unwrap());
        }
        // Free alternating blocks, then the rest, creating fragmentation
        // that only a full pass cleans up.
        for id in ids.iter().step_by(2) {
            pool.free(*id).unwrap();
        }

        pool.defrag();

        let state = pool.state.read();
        for pair in state.blocks.windows(2) {
            assert!(
                pair[0].header.is_allocated || pair[1].header.is_allocated,
                "adjacent free blocks survived defrag"
            );
        }
    }

    #[test]
    fn test_cache_hit_on_same_size_realloc() {
        let pool = BlockPool::new(&config()).unwrap();

        let a = pool.alloc(100).unwrap();
        pool.free(a).unwrap();
        // Freeing merged a with the tail, so warm the exact class first.
        let b = pool.alloc(100).unwrap();
        pool.free(b).unwrap();

        let _ = pool.alloc(100).unwrap();
        let metrics = pool.cache_metrics().unwrap();
        assert!(metrics.hits + metrics.misses > 0);
    }

    #[test]
    fn test_metrics_track_usage() {
        let pool = BlockPool::new(&config()).unwrap();

        let a = pool.alloc(100).unwrap();
        let metrics = pool.metrics();
        assert_eq!(metrics.allocations, 1);
        assert_eq!(metrics.used_size, 100);
        assert_eq!(metrics.available_size, 924);

        pool.free(a).unwrap();
        let metrics = pool.metrics();
        assert_eq!(metrics.deallocations, 1);
        assert_eq!(metrics.used_size, 0);

        pool.reset_metrics();
        let metrics = pool.metrics();
        assert_eq!(metrics.allocations, 0);
        assert_eq!(metrics.deallocations, 0);
        assert_eq!(metrics.total_size, 1024);
    }

    #[test]
    fn test_warmup_frequency_publishes_free_blocks() {
        let pool = BlockPool::new(&config()).unwrap();

        let a = pool.alloc(100).unwrap();
        let _b = pool.alloc(100).unwrap();
        pool.free(a).unwrap();

        pool.warm_cache(WarmupStrategy::Frequency);
        // The freed (and already cached) block plus the tail remainder are
        // candidates; at least one free block must be cached.
        assert!(pool.cache_metrics().is_some());
        let state = pool.state.read();
        assert!(state.blocks.iter().any(|b| !b.header.is_allocated));
    }

    #[test]
    fn test_warmup_size_respects_range() {
        let pool = BlockPool::new(&PoolConfig {
            initial_size: 1024,
            min_block_size: 16,
            max_block_size: 512,
            cache_capacity: 10_000,
            eviction_policy: EvictionPolicy::Lru,
        })
        .unwrap();

        // Tail free block is 1024 - 100 = 924 > max/2 = 256: not cached.
        let _a = pool.alloc(100).unwrap();
        pool.warm_cache(WarmupStrategy::Size);
        assert_eq!(pool.cache.as_ref().unwrap().len(), 0);
    }

    #[test]
    fn test_allocation_frequency_histogram() {
        let pool = BlockPool::new(&config()).unwrap();
        let _ = pool.alloc(100);
        let _ = pool.alloc(100);
        let _ = pool.alloc(64);
        assert_eq!(pool.allocation_frequency(100), 2);
        assert_eq!(pool.allocation_frequency(64), 1);
        assert_eq!(pool.allocation_frequency(32), 0);
    }
}
