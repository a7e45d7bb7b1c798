//! Layer Abstraction
//!
//! The contract each physical tier implements. Only the memory tier ever
//! returns an error from `get`/`get_any_age` (a [`Error::TypeMismatch`]);
//! durable tiers turn every storage or decode failure into a miss.
//!
//! [`Error::TypeMismatch`]: crate::error::Error::TypeMismatch

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::entry::{CacheEntry, Cacheable};
use super::key::{CacheKey, KeyPattern};
use super::stats::LayerStatsSnapshot;
use crate::error::Result;

/// Tier identifier, ordered fastest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheTier {
    /// Process-local memory
    Memory,
    /// Flat store / per-key files
    Persistent,
    /// Typed record store
    Structured,
}

impl CacheTier {
    pub fn name(&self) -> &'static str {
        match self {
            CacheTier::Memory => "memory",
            CacheTier::Persistent => "persistent",
            CacheTier::Structured => "structured",
        }
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Contract every tier satisfies
#[async_trait]
pub trait CacheLayer: Send + Sync {
    /// Which tier this is
    fn tier(&self) -> CacheTier;

    /// Value if present and `now - cached_at < ttl`
    async fn get<T: Cacheable>(&self, key: &CacheKey, ttl: Duration) -> Result<Option<CacheEntry<T>>>;

    /// Value of any age
    async fn get_any_age<T: Cacheable>(&self, key: &CacheKey) -> Result<Option<CacheEntry<T>>>;

    /// Unconditional upsert
    async fn set<T: Cacheable>(&self, key: &CacheKey, value: &T, cached_at: DateTime<Utc>) -> Result<()>;

    /// Idempotent delete
    async fn remove(&self, key: &CacheKey) -> Result<()>;

    /// Delete every matching key, returning how many were removed
    async fn remove_matching(&self, pattern: &KeyPattern) -> Result<usize>;

    /// Side-effect-free validity check that does not decode the value
    async fn contains(&self, key: &CacheKey, ttl: Duration) -> Result<bool>;

    fn stats(&self) -> LayerStatsSnapshot;

    fn reset_stats(&self);
}
