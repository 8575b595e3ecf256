//! Hit/miss accounting for the two cache tiers.

use serde::Serialize;

/// Hit/miss counters for one tier (or both combined).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierStats {
    pub hits: u64,
    pub misses: u64,
}

impl TierStats {
    pub fn accesses(&self) -> u64 {
        self.hits + self.misses
    }

    /// `hits / (hits + misses)`, `0.0` before the first access.
    pub fn hit_rate(&self) -> f64 {
        match self.accesses() {
            0 => 0.0,
            n => self.hits as f64 / n as f64,
        }
    }

    pub(crate) fn hit(&mut self) {
        self.hits += 1;
    }

    pub(crate) fn miss(&mut self) {
        self.misses += 1;
    }
}

/// Snapshot returned by [`SliceCache::stats`](super::SliceCache::stats).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub l1: TierStats,
    pub l2: TierStats,
    /// A lookup counts once here: a hit in either tier or a full miss.
    pub overall: TierStats,
    pub l1_entries: usize,
    pub l2_entries: usize,
    pub l2_bytes: u64,
    pub l1_evictions: u64,
    pub l2_evictions: u64,
    pub l2_expired: u64,
    pub prefetch_queued: usize,
}
