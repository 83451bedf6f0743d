//! Recency-ordered block cache with policy-driven eviction.
//!
//! Entries are kept in an `IndexMap` in recency order (front = least
//! recently used, back = most recent), giving O(1) lookup with cheap
//! move-to-back. The cache is bounded by total cached *bytes*, not entry
//! count.

#![allow(clippy::cast_precision_loss)] // hit-rate arithmetic

use indexmap::IndexMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::pool::BlockId;

/// How the cache chooses a victim when over capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Drop the least recently used entry unconditionally.
    #[default]
    Lru,
    /// Drop the least recently used entry only when its size falls outside
    /// the configured block-size range.
    SizeBased,
    /// Score every entry as `0.7 * recency_rank + 0.3 * size` and evict
    /// the minimum; ties break toward the LRU end.
    Hybrid,
}

/// A cached reference to a free pool block.
#[derive(Debug, Clone, Copy)]
pub struct CacheEntry {
    /// Handle of the cached block.
    pub block: BlockId,
    /// Block size in bytes; counted against the cache capacity.
    pub size: u64,
}

/// Cache statistics, returned by value.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheMetrics {
    /// Successful lookups.
    pub hits: u64,
    /// Failed lookups.
    pub misses: u64,
    /// Entries removed by eviction.
    pub evictions: u64,
    /// Total lookups.
    pub total_requests: u64,
    /// `hits / total_requests`, 0 when no requests were made.
    pub hit_rate: f64,
}

#[derive(Debug)]
struct CacheState {
    /// Recency order: front = LRU, back = MRU.
    entries: IndexMap<String, CacheEntry>,
    /// Sum of cached entry sizes; never exceeds `capacity`.
    total_cached_size: u64,
}

/// Byte-bounded cache of free blocks.
#[derive(Debug)]
pub struct BlockCache {
    capacity: u64,
    policy: EvictionPolicy,
    min_block_size: u64,
    max_block_size: u64,
    state: RwLock<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl BlockCache {
    /// Creates a cache bounded by `capacity` bytes.
    #[must_use]
    pub fn new(
        capacity: u64,
        policy: EvictionPolicy,
        min_block_size: u64,
        max_block_size: u64,
    ) -> Self {
        Self {
            capacity,
            policy,
            min_block_size,
            max_block_size,
            state: RwLock::new(CacheState {
                entries: IndexMap::new(),
                total_cached_size: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Returns true if the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    /// Total bytes currently cached.
    #[must_use]
    pub fn cached_bytes(&self) -> u64 {
        self.state.read().total_cached_size
    }

    /// Inserts or refreshes an entry.
    ///
    /// Entries outside the `[min_block_size, max_block_size]` range are
    /// skipped. On update the byte accounting is adjusted by the size
    /// delta; on insert, entries are evicted until the new entry fits.
    /// If eviction cannot make room (the policy declined), the entry is
    /// not inserted: the capacity bound always holds.
    pub fn put(&self, key: &str, entry: CacheEntry) {
        if entry.size < self.min_block_size || entry.size > self.max_block_size {
            return;
        }

        let mut state = self.state.write();

        if let Some(existing) = state.entries.shift_remove(key) {
            // Refresh: re-insert at the MRU end with adjusted accounting.
            state.total_cached_size -= existing.size;
            state.total_cached_size += entry.size;
            state.entries.insert(key.to_string(), entry);
            return;
        }

        while state.total_cached_size + entry.size > self.capacity && !state.entries.is_empty() {
            if !self.evict_one(&mut state) {
                break;
            }
        }

        if state.total_cached_size + entry.size <= self.capacity {
            state.entries.insert(key.to_string(), entry);
            state.total_cached_size += entry.size;
        }
    }

    /// Looks up an entry, refreshing its recency on hit.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut state = self.state.write();

        if let Some(entry) = state.entries.shift_remove(key) {
            // Move to the MRU end.
            state.entries.insert(key.to_string(), entry);
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(entry)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Removes an entry. Returns true if it existed.
    pub fn remove(&self, key: &str) -> bool {
        let mut state = self.state.write();
        if let Some(entry) = state.entries.shift_remove(key) {
            state.total_cached_size -= entry.size;
            true
        } else {
            false
        }
    }

    /// Evicts one entry according to the configured policy.
    ///
    /// Returns false when the policy declined to evict anything.
    fn evict_one(&self, state: &mut CacheState) -> bool {
        match self.policy {
            EvictionPolicy::Lru => self.evict_front(state),
            EvictionPolicy::SizeBased => {
                let evictable = state.entries.get_index(0).is_some_and(|(_, e)| {
                    e.size < self.min_block_size || e.size > self.max_block_size
                });
                if evictable {
                    self.evict_front(state)
                } else {
                    false
                }
            }
            EvictionPolicy::Hybrid => self.evict_hybrid(state),
        }
    }

    /// Drops the LRU entry (front of the order).
    fn evict_front(&self, state: &mut CacheState) -> bool {
        if let Some((_, entry)) = state.entries.shift_remove_index(0) {
            state.total_cached_size -= entry.size;
            self.evictions.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Full scan for the minimum hybrid score.
    ///
    /// `recency_rank` is the distance from the MRU end (0 = most recent).
    /// Scanning starts at the LRU end with a strict comparison, so equal
    /// scores keep the LRU-end victim.
    fn evict_hybrid(&self, state: &mut CacheState) -> bool {
        let len = state.entries.len();
        if len == 0 {
            return false;
        }

        let mut victim = 0;
        let mut min_score = f64::MAX;
        for (idx, (_, entry)) in state.entries.iter().enumerate() {
            let recency_rank = (len - 1 - idx) as f64;
            let score = 0.7 * recency_rank + 0.3 * entry.size as f64;
            if score < min_score {
                min_score = score;
                victim = idx;
            }
        }

        if let Some((_, entry)) = state.entries.shift_remove_index(victim) {
            state.total_cached_size -= entry.size;
            self.evictions.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Returns a copy of the current metrics.
    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheMetrics {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            total_requests: total,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        }
    }

    /// Resets hit/miss/eviction counters.
    pub fn reset_metrics(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }
}
