//! Cache Statistics
//!
//! Counters are purely observational and never influence cache behavior.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-layer counters
#[derive(Debug, Default)]
pub struct LayerStats {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    evictions: AtomicU64,
}

impl LayerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LayerStatsSnapshot {
        LayerStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.sets.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`LayerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayerStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
}

impl LayerStatsSnapshot {
    /// Hit ratio (0.0 - 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Orchestrator-level counters
#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Fetch fallback invocations
    fetches: AtomicU64,
    /// Stale values served after an upstream failure or by cache-first reads
    stale_served: AtomicU64,
    background_refreshes: AtomicU64,
    refresh_failures: AtomicU64,
    promotions: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_fetch(&self) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_served(&self) {
        self.stale_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_background_refresh(&self) {
        self.background_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_failure(&self) {
        self.refresh_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for counter in [
            &self.fetches,
            &self.stale_served,
            &self.background_refreshes,
            &self.refresh_failures,
            &self.promotions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    pub fn stale_served(&self) -> u64 {
        self.stale_served.load(Ordering::Relaxed)
    }

    pub fn background_refreshes(&self) -> u64 {
        self.background_refreshes.load(Ordering::Relaxed)
    }

    pub fn refresh_failures(&self) -> u64 {
        self.refresh_failures.load(Ordering::Relaxed)
    }

    pub fn promotions(&self) -> u64 {
        self.promotions.load(Ordering::Relaxed)
    }
}

/// Statistics across all tiers, returned by `TieredCache::statistics`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStatistics {
    pub memory: LayerStatsSnapshot,
    pub persistent: LayerStatsSnapshot,
    pub structured: LayerStatsSnapshot,
    /// Entries currently held in memory
    pub memory_entries: usize,
    /// Fetches currently in flight
    pub in_flight: usize,
    pub fetches: u64,
    /// Callers that joined an in-flight fetch instead of starting one
    pub coalesced: u64,
    pub stale_served: u64,
    pub background_refreshes: u64,
    pub refresh_failures: u64,
    pub promotions: u64,
}

impl CacheStatistics {
    /// Hits across all tiers
    pub fn total_hits(&self) -> u64 {
        self.memory.hits + self.persistent.hits + self.structured.hits
    }
}
