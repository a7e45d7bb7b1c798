//! Memory Layer - process-local hot tier
//!
//! Volatile key → entry map bounded by entry count, plus the single point of
//! request coalescing for the whole cache.
//!
//! # Design
//!
//! - Values are stored type-erased (`Arc<dyn Any>`) with their `TypeId`;
//!   reading with another type is a [`Error::TypeMismatch`], never a miss
//! - Eviction removes the oldest entries by `cached_at` once the count
//!   exceeds `max_entries`
//! - [`MemoryLayer::deduplicate`] keeps at most one fetch per key in flight;
//!   the fetch runs on its own task so it settles even if every waiter is
//!   cancelled, and its ticket is released exactly once when it does
//!
//! Locks guard map mutation only and are never held across an `.await`.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::clock::{Clock, SystemClock};
use super::entry::{is_within_ttl, CacheEntry, Cacheable};
use super::key::{CacheKey, KeyPattern};
use super::layer::{CacheLayer, CacheTier};
use super::policy::EvictionPolicy;
use super::stats::{LayerStats, LayerStatsSnapshot};
use crate::error::{Error, Result};

type AnyValue = Arc<dyn Any + Send + Sync>;
type FetchOutcome = std::result::Result<AnyValue, Arc<anyhow::Error>>;
type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;
type InFlightMap = Arc<Mutex<HashMap<CacheKey, InFlight>>>;

struct MemoryEntry {
    value: AnyValue,
    type_id: TypeId,
    type_name: &'static str,
    cached_at: DateTime<Utc>,
}

/// In-flight request ticket
struct InFlight {
    id: u64,
    future: SharedFetch,
    type_id: TypeId,
    type_name: &'static str,
}

/// Removes a ticket when the fetch task finishes, panics or is aborted
struct TicketRelease {
    in_flight: InFlightMap,
    key: CacheKey,
    id: u64,
}

impl Drop for TicketRelease {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock();
        if in_flight.get(&self.key).map_or(false, |t| t.id == self.id) {
            in_flight.remove(&self.key);
        }
    }
}

/// Memory Layer
pub struct MemoryLayer {
    entries: RwLock<HashMap<CacheKey, MemoryEntry>>,
    in_flight: InFlightMap,
    next_ticket: AtomicU64,
    policy: EvictionPolicy,
    clock: Arc<dyn Clock>,
    stats: LayerStats,
    coalesced: AtomicU64,
}

impl MemoryLayer {
    /// Create a memory layer with default limits and the system clock
    pub fn new() -> Self {
        Self::with_policy(EvictionPolicy::default(), Arc::new(SystemClock))
    }

    pub fn with_policy(policy: EvictionPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_ticket: AtomicU64::new(0),
            policy,
            clock,
            stats: LayerStats::new(),
            coalesced: AtomicU64::new(0),
        }
    }

    /// Read an entry of any age, checking its type
    fn read<T: Cacheable>(&self, key: &CacheKey) -> Result<Option<CacheEntry<T>>> {
        let entries = self.entries.read();
        let Some(entry) = entries.get(key) else {
            return Ok(None);
        };
        if entry.type_id != TypeId::of::<T>() {
            return Err(Error::TypeMismatch {
                key: key.to_string(),
                expected: type_name::<T>(),
                found: entry.type_name,
            });
        }
        Ok(entry
            .value
            .downcast_ref::<T>()
            .map(|value| CacheEntry::new(value.clone(), entry.cached_at)))
    }

    /// Insert and run eviction if the count limit is exceeded
    fn insert<T: Cacheable>(&self, key: &CacheKey, value: T, cached_at: DateTime<Utc>) {
        let entry = MemoryEntry {
            value: Arc::new(value),
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            cached_at,
        };

        let evicted = {
            let mut entries = self.entries.write();
            entries.insert(key.clone(), entry);
            Self::evict_oldest(&mut entries, &self.policy, key)
        };

        self.stats.record_set();
        if evicted > 0 {
            self.stats.record_evictions(evicted as u64);
            debug!(evicted, "Memory layer evicted oldest entries");
        }
    }

    /// Remove the oldest entries by `cached_at` when over capacity.
    /// `inserted` is never a candidate, however old its `cached_at`.
    fn evict_oldest(
        entries: &mut HashMap<CacheKey, MemoryEntry>,
        policy: &EvictionPolicy,
        inserted: &CacheKey,
    ) -> usize {
        if entries.len() <= policy.max_entries {
            return 0;
        }

        let overflow = entries.len() - policy.max_entries;
        let batch = policy.eviction_batch_size.max(overflow);

        let mut candidates: Vec<(DateTime<Utc>, CacheKey)> = entries
            .iter()
            .filter(|(key, _)| *key != inserted)
            .map(|(key, entry)| (entry.cached_at, key.clone()))
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        let mut evicted = 0;
        for (_, key) in candidates.into_iter().take(batch) {
            if entries.remove(&key).is_some() {
                evicted += 1;
            }
        }
        evicted
    }

    /// Run `operation` at most once concurrently per key.
    ///
    /// Callers arriving while a fetch for `key` is in flight receive the same
    /// value or the same error without invoking their own operation.
    pub async fn deduplicate<T, F, Fut>(&self, key: &CacheKey, operation: F) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let future = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(key) {
                Some(ticket) => {
                    if ticket.type_id != TypeId::of::<T>() {
                        return Err(Error::TypeMismatch {
                            key: key.to_string(),
                            expected: type_name::<T>(),
                            found: ticket.type_name,
                        });
                    }
                    self.coalesced.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, ticket = ticket.id, "Joining in-flight fetch");
                    ticket.future.clone()
                }
                None => {
                    let id = self.next_ticket.fetch_add(1, Ordering::Relaxed);
                    let release = TicketRelease {
                        in_flight: Arc::clone(&self.in_flight),
                        key: key.clone(),
                        id,
                    };

                    let handle = tokio::spawn(async move {
                        let _release = release;
                        operation()
                            .await
                            .map(|value| Arc::new(value) as AnyValue)
                            .map_err(Arc::new)
                    });

                    let task_key = key.clone();
                    let future = async move {
                        match handle.await {
                            Ok(outcome) => outcome,
                            Err(err) => Err(Arc::new(anyhow::anyhow!(
                                "fetch task for {task_key} did not complete: {err}"
                            ))),
                        }
                    }
                    .boxed()
                    .shared();

                    in_flight.insert(
                        key.clone(),
                        InFlight {
                            id,
                            future: future.clone(),
                            type_id: TypeId::of::<T>(),
                            type_name: type_name::<T>(),
                        },
                    );
                    future
                }
            }
        };

        let value = future.await.map_err(Error::Upstream)?;
        match value.downcast::<T>() {
            Ok(value) => Ok(T::clone(&value)),
            Err(_) => Err(Error::TypeMismatch {
                key: key.to_string(),
                expected: type_name::<T>(),
                found: "<in-flight value>",
            }),
        }
    }

    /// Whether a fetch for `key` is currently in flight
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.in_flight.lock().contains_key(key)
    }

    /// Number of fetches in flight
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Callers that joined an existing fetch
    pub fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    /// Get number of entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if layer is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop every entry. In-flight fetches are left alone.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn policy(&self) -> &EvictionPolicy {
        &self.policy
    }
}

impl Default for MemoryLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheLayer for MemoryLayer {
    fn tier(&self) -> CacheTier {
        CacheTier::Memory
    }

    async fn get<T: Cacheable>(&self, key: &CacheKey, ttl: Duration) -> Result<Option<CacheEntry<T>>> {
        let now = self.clock.now();
        let entry = self.read::<T>(key)?.filter(|e| e.is_fresh(ttl, now));
        match entry {
            Some(_) => self.stats.record_hit(),
            None => self.stats.record_miss(),
        }
        Ok(entry)
    }

    async fn get_any_age<T: Cacheable>(&self, key: &CacheKey) -> Result<Option<CacheEntry<T>>> {
        self.read(key)
    }

    async fn set<T: Cacheable>(&self, key: &CacheKey, value: &T, cached_at: DateTime<Utc>) -> Result<()> {
        self.insert(key, value.clone(), cached_at);
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn remove_matching(&self, pattern: &KeyPattern) -> Result<usize> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, _| !pattern.matches(key));
        Ok(before - entries.len())
    }

    async fn contains(&self, key: &CacheKey, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        Ok(self
            .entries
            .read()
            .get(key)
            .map_or(false, |entry| is_within_ttl(entry.cached_at, ttl, now)))
    }

    fn stats(&self) -> LayerStatsSnapshot {
        self.stats.snapshot()
    }

    fn reset_stats(&self) {
        self.stats.reset();
        self.coalesced.store(0, Ordering::Relaxed);
    }
}

// =============================================================================
// Tests
// =============================================================================
