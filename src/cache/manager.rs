//! Cache Manager - Unified Three-Tier Cache
//!
//! Composes the memory, persistent and structured tiers into one logical
//! cache with read-through promotion, write fan-out, strict fetches and
//! stale-while-revalidate fetches.
//!
//! Every operation waits for the schema version guard, which runs once per
//! [`TieredCache`] instance before any data is observed.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::codec::{normalize, ForeignValue, LeafPolicy};
use super::connectivity::{AlwaysOnline, Connectivity};
use super::entry::{CacheEntry, Cacheable};
use super::key::{CacheKey, KeyPattern};
use super::layer::{CacheLayer, CacheTier};
use super::memory::MemoryLayer;
use super::persistent::{PersistedEntry, PersistentConfig, PersistentLayer};
use super::policy::{EvictionPolicy, TtlPolicy};
use super::stats::{CacheMetrics, CacheStatistics};
use super::storage::{
    DirFileStore, FileStore, FlatStore, InMemoryFileStore, InMemoryFlatStore, JsonFileFlatStore, NamespacedFlatStore,
};
use super::structured::{InMemoryRecordStore, JsonFileRecordStore, RecordStore, StoredRecord, StructuredLayer};
use super::version::{VersionGuard, CURRENT_SCHEMA_VERSION};
use crate::error::{Error, Result};

/// Flat-store prefix of the default schema marker
const MARKER_NAMESPACE: &str = "meta/";

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Memory tier limits
    pub memory: EvictionPolicy,
    /// Persistent tier storage selection
    pub persistent: PersistentConfig,
    /// Schema version every persisted artifact is checked against
    pub schema_version: u32,
    /// TTL by key kind
    pub ttl_policy: TtlPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory: EvictionPolicy::default(),
            persistent: PersistentConfig::default(),
            schema_version: CURRENT_SCHEMA_VERSION,
            ttl_policy: TtlPolicy::default(),
        }
    }
}

impl CacheConfig {
    /// Parse a YAML document. Missing fields take their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(format!("invalid cache config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<()> {
        if self.memory.max_entries == 0 {
            return Err(Error::Config("memory.max_entries must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn with_schema_version(mut self, schema_version: u32) -> Self {
        self.schema_version = schema_version;
        self
    }

    pub fn with_memory(mut self, memory: EvictionPolicy) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_persistent(mut self, persistent: PersistentConfig) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_ttl_policy(mut self, ttl_policy: TtlPolicy) -> Self {
        self.ttl_policy = ttl_policy;
        self
    }
}

/// A value together with the tier that served it
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit<T> {
    pub value: T,
    pub tier: CacheTier,
    pub cached_at: DateTime<Utc>,
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`TieredCache`]. Stores left unset are in-memory.
pub struct TieredCacheBuilder {
    config: CacheConfig,
    flat: Option<Arc<dyn FlatStore>>,
    files: Option<Arc<dyn FileStore>>,
    records: Option<Arc<dyn RecordStore>>,
    marker: Option<Arc<dyn FlatStore>>,
    connectivity: Arc<dyn Connectivity>,
    clock: Arc<dyn Clock>,
}

impl TieredCacheBuilder {
    fn new() -> Self {
        Self {
            config: CacheConfig::default(),
            flat: None,
            files: None,
            records: None,
            marker: None,
            connectivity: Arc::new(AlwaysOnline),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn schema_version(mut self, schema_version: u32) -> Self {
        self.config.schema_version = schema_version;
        self
    }

    pub fn flat_store(mut self, store: Arc<dyn FlatStore>) -> Self {
        self.flat = Some(store);
        self
    }

    pub fn file_store(mut self, store: Arc<dyn FileStore>) -> Self {
        self.files = Some(store);
        self
    }

    pub fn record_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.records = Some(store);
        self
    }

    /// Store holding the schema marker. Defaults to a `meta/` namespace of
    /// the flat store, so the marker lives exactly as long as the entries.
    pub fn marker_store(mut self, store: Arc<dyn FlatStore>) -> Self {
        self.marker = Some(store);
        self
    }

    pub fn connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<TieredCache> {
        self.config.validate()?;
        Ok(self.assemble())
    }

    fn assemble(self) -> TieredCache {
        let schema_version = self.config.schema_version;

        let flat = self.flat.unwrap_or_else(|| Arc::new(InMemoryFlatStore::new()));
        let files = self.files.unwrap_or_else(|| Arc::new(InMemoryFileStore::new()));
        let records = self.records.unwrap_or_else(|| Arc::new(InMemoryRecordStore::new()));
        let marker = self
            .marker
            .unwrap_or_else(|| Arc::new(NamespacedFlatStore::new(Arc::clone(&flat), MARKER_NAMESPACE)));

        let inner = Inner {
            memory: MemoryLayer::with_policy(self.config.memory, Arc::clone(&self.clock)),
            persistent: PersistentLayer::new(flat, files)
                .with_config(self.config.persistent)
                .with_schema_version(schema_version)
                .with_clock(Arc::clone(&self.clock)),
            structured: StructuredLayer::new(records)
                .with_schema_version(schema_version)
                .with_clock(Arc::clone(&self.clock)),
            version: VersionGuard::new(marker, schema_version),
            version_checked: OnceCell::new(),
            connectivity: self.connectivity,
            clock: self.clock,
            ttl_policy: self.config.ttl_policy,
            metrics: CacheMetrics::new(),
            shutdown: CancellationToken::new(),
            background: TaskTracker::new(),
        };

        TieredCache {
            inner: Arc::new(inner),
        }
    }
}

// =============================================================================
// Tiered Cache
// =============================================================================

/// Unified tiered cache. Cheap to clone; clones share every tier.
#[derive(Clone)]
pub struct TieredCache {
    inner: Arc<Inner>,
}

struct Inner {
    memory: MemoryLayer,
    persistent: PersistentLayer,
    structured: StructuredLayer,
    version: VersionGuard,
    version_checked: OnceCell<()>,
    connectivity: Arc<dyn Connectivity>,
    clock: Arc<dyn Clock>,
    ttl_policy: TtlPolicy,
    metrics: CacheMetrics,
    shutdown: CancellationToken,
    background: TaskTracker,
}

impl TieredCache {
    pub fn builder() -> TieredCacheBuilder {
        TieredCacheBuilder::new()
    }

    /// Cache with every tier in memory
    pub fn in_memory() -> Self {
        TieredCacheBuilder::new().assemble()
    }

    /// Open a cache rooted at `dir`:
    ///
    /// ```text
    /// <dir>/entries.json   flat store (small envelopes)
    /// <dir>/files/         entry files (large envelopes)
    /// <dir>/records.json   structured records
    /// <dir>/meta.json      schema marker
    /// ```
    pub async fn open(dir: impl AsRef<Path>, config: CacheConfig) -> Result<Self> {
        Self::open_with(dir, Self::builder().config(config)).await
    }

    /// Open on disk with further builder options (clock, connectivity)
    pub async fn open_with(dir: impl AsRef<Path>, builder: TieredCacheBuilder) -> Result<Self> {
        let layout = CacheLayout::new(dir.as_ref());
        tokio::fs::create_dir_all(&layout.root).await?;

        let cache = builder
            .flat_store(Arc::new(JsonFileFlatStore::open(&layout.entries).await?))
            .file_store(Arc::new(DirFileStore::open(&layout.files).await?))
            .record_store(Arc::new(JsonFileRecordStore::open(&layout.records).await?))
            .marker_store(Arc::new(JsonFileFlatStore::open(&layout.meta).await?))
            .build()?;

        info!(dir = %layout.root.display(), "Opened tiered cache");
        Ok(cache)
    }

    /// Register `T` as the structured record type for keys of `kind`
    pub fn register<T: Cacheable>(&self, kind: &str) -> &Self {
        self.inner.structured.register::<T>(kind);
        self
    }

    /// Whether values of `T` under `key` reach the structured tier
    pub fn is_persistable<T: Cacheable>(&self, key: &CacheKey) -> bool {
        self.inner.structured.accepts::<T>(key)
    }

    /// Run the schema version guard now instead of on first use
    pub async fn ensure_ready(&self) {
        self.inner.ensure_ready().await;
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Fresh value from the first tier holding one
    pub async fn get<T: Cacheable>(&self, key: &CacheKey, ttl: Duration) -> Result<Option<T>> {
        Ok(self.get_entry(key, ttl).await?.map(|hit| hit.value))
    }

    /// Fresh value with the tier that served it
    pub async fn get_entry<T: Cacheable>(&self, key: &CacheKey, ttl: Duration) -> Result<Option<CacheHit<T>>> {
        self.inner.ensure_ready().await;
        Ok(self
            .inner
            .probe::<T>(key, ttl)
            .await?
            .map(|(entry, tier)| CacheHit {
                value: entry.value,
                tier,
                cached_at: entry.cached_at,
            }))
    }

    /// Whether any tier holds a value for `key` younger than `ttl`
    pub async fn is_valid(&self, key: &CacheKey, ttl: Duration) -> Result<bool> {
        self.inner.ensure_ready().await;
        let inner = &self.inner;
        Ok(inner.memory.contains(key, ttl).await?
            || inner.persistent.contains(key, ttl).await.unwrap_or(false)
            || inner.structured.contains(key, ttl).await.unwrap_or(false))
    }

    // =========================================================================
    // Fetches
    // =========================================================================

    /// Strict fetch.
    ///
    /// Returns a fresh cached value, otherwise invokes `fallback` (at most
    /// once across concurrent callers for the key) and stores its result in
    /// every applicable tier. If the fallback fails, the newest value of any
    /// age is served instead; with nothing cached, the fallback's error is
    /// returned as is.
    pub async fn fetch<T, F, Fut>(&self, key: &CacheKey, ttl: Duration, fallback: F) -> Result<T>
    where
        T: Cacheable,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.inner.ensure_ready().await;

        if let Some((entry, tier)) = self.inner.probe::<T>(key, ttl).await? {
            debug!(key = %key, %tier, "Cache hit");
            return Ok(entry.value);
        }

        match self.inner.fetch_and_store(key, ttl, fallback).await {
            Err(Error::Upstream(err)) => match self.inner.probe_any_age::<T>(key, false).await {
                Ok(Some((entry, tier))) => {
                    let age = entry.age(self.inner.clock.now());
                    warn!(
                        key = %key,
                        %tier,
                        age_secs = age.as_secs(),
                        error = %err,
                        "Upstream fetch failed, serving stale value"
                    );
                    self.inner.metrics.record_stale_served();
                    Ok(entry.value)
                }
                _ => Err(Error::Upstream(err)),
            },
            other => other,
        }
    }

    /// Cache-first fetch (stale-while-revalidate).
    ///
    /// Any cached value is returned immediately. An expired one also starts
    /// a background refresh when online. With nothing cached, offline fails
    /// with [`Error::Offline`] without calling `fallback`; online falls
    /// through to a strict fetch.
    pub async fn fetch_cache_first<T, F, Fut>(&self, key: &CacheKey, ttl: Duration, fallback: F) -> Result<T>
    where
        T: Cacheable,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.inner.ensure_ready().await;

        if let Some((entry, tier)) = self.inner.probe::<T>(key, ttl).await? {
            debug!(key = %key, %tier, "Cache hit");
            return Ok(entry.value);
        }

        if let Some((entry, tier)) = self.inner.probe_any_age::<T>(key, true).await? {
            debug!(key = %key, %tier, "Serving expired value, refreshing in background");
            self.inner.metrics.record_stale_served();
            self.spawn_refresh(key.clone(), ttl, fallback);
            return Ok(entry.value);
        }

        if !self.inner.connectivity.is_online().await {
            debug!(key = %key, "Offline with nothing cached");
            return Err(Error::Offline { key: key.to_string() });
        }

        self.inner.fetch_and_store(key, ttl, fallback).await
    }

    /// Strict fetch with the TTL declared for the key's kind
    pub async fn fetch_with_policy<T, F, Fut>(&self, key: &CacheKey, fallback: F) -> Result<T>
    where
        T: Cacheable,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let ttl = self
            .inner
            .ttl_policy
            .ttl_for(key)
            .ok_or_else(|| Error::Config(format!("no TTL policy covers key {key}")))?;
        self.fetch(key, ttl, fallback).await
    }

    fn spawn_refresh<T, F, Fut>(&self, key: CacheKey, ttl: Duration, fallback: F)
    where
        T: Cacheable,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        if self.inner.shutdown.is_cancelled() {
            debug!(key = %key, "Cache shut down, not refreshing");
            return;
        }

        let inner = Arc::clone(&self.inner);
        let token = self.inner.shutdown.clone();
        self.inner.background.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => debug!(key = %key, "Background refresh cancelled"),
                _ = inner.refresh(&key, ttl, fallback) => {}
            }
        });
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store a value in every applicable tier, stamped now
    pub async fn set<T: Cacheable>(&self, key: &CacheKey, value: T) -> Result<()> {
        self.inner.ensure_ready().await;
        self.inner.fan_out(key, &value, self.inner.clock.now()).await;
        Ok(())
    }

    /// Normalize a foreign value and store it as JSON.
    ///
    /// Returns the paths of leaves dropped under [`LeafPolicy::Skip`].
    pub async fn set_foreign(&self, key: &CacheKey, value: &ForeignValue, policy: LeafPolicy) -> Result<Vec<String>> {
        let normalized = normalize(value, policy)?;
        if !normalized.skipped.is_empty() {
            warn!(key = %key, skipped = ?normalized.skipped, "Dropped unencodable leaves");
        }
        self.set(key, normalized.value).await?;
        Ok(normalized.skipped)
    }

    /// Remove `key` from every tier
    pub async fn invalidate(&self, key: &CacheKey) -> Result<()> {
        self.inner.ensure_ready().await;
        let inner = &self.inner;

        inner.memory.remove(key).await?;
        if let Err(e) = inner.persistent.remove(key).await {
            warn!(key = %key, error = %e, "Persistent invalidation failed");
        }
        log_structured_failure(inner.structured.remove(key).await, key.as_str());
        Ok(())
    }

    /// Remove every key matching `pattern` (`"*"` or an anchored regex)
    pub async fn invalidate_matching(&self, pattern: &str) -> Result<usize> {
        let pattern = KeyPattern::new(pattern)?;
        self.invalidate_pattern(&pattern).await
    }

    /// Remove every key matching a compiled pattern, returning how many
    /// entries were removed across all tiers
    pub async fn invalidate_pattern(&self, pattern: &KeyPattern) -> Result<usize> {
        self.inner.ensure_ready().await;
        let removed = self.inner.remove_matching(pattern).await;
        info!(%pattern, removed, "Invalidated matching keys");
        Ok(removed)
    }

    /// Delete structured records past their policy TTL
    pub async fn purge_expired(&self) -> Result<usize> {
        self.inner.ensure_ready().await;
        self.inner.structured.purge_expired(&self.inner.ttl_policy).await
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    pub fn statistics(&self) -> CacheStatistics {
        let inner = &self.inner;
        CacheStatistics {
            memory: inner.memory.stats(),
            persistent: inner.persistent.stats(),
            structured: inner.structured.stats(),
            memory_entries: inner.memory.len(),
            in_flight: inner.memory.in_flight_count(),
            fetches: inner.metrics.fetches(),
            coalesced: inner.memory.coalesced(),
            stale_served: inner.metrics.stale_served(),
            background_refreshes: inner.metrics.background_refreshes(),
            refresh_failures: inner.metrics.refresh_failures(),
            promotions: inner.metrics.promotions(),
        }
    }

    pub fn reset_statistics(&self) {
        let inner = &self.inner;
        inner.memory.reset_stats();
        inner.persistent.reset_stats();
        inner.structured.reset_stats();
        inner.metrics.reset();
    }

    /// Persisted entries with their envelope headers
    pub async fn persisted_entries(&self) -> Result<Vec<PersistedEntry>> {
        self.inner.persistent.list_entries().await
    }

    /// Structured records, undecoded
    pub async fn structured_records(&self) -> Result<Vec<StoredRecord>> {
        self.inner.structured.list_records().await
    }

    pub fn schema_version(&self) -> u32 {
        self.inner.version.current()
    }

    pub fn ttl_policy(&self) -> &TtlPolicy {
        &self.inner.ttl_policy
    }

    /// Wait until every background refresh started so far has finished
    pub async fn wait_for_background(&self) {
        let tracker = &self.inner.background;
        tracker.close();
        tracker.wait().await;
        tracker.reopen();
    }

    /// Cancel background refreshes and wait for them to stop
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.background.close();
        self.inner.background.wait().await;
        info!("Tiered cache shut down");
    }
}

impl Inner {
    /// Run the version guard once; concurrent callers wait for it
    async fn ensure_ready(&self) {
        self.version_checked
            .get_or_init(|| async {
                let state = self.version.check().await;
                if !state.requires_clear() {
                    debug!(version = self.version.current(), "Schema marker is current");
                    return;
                }

                match state.mismatch(self.version.current()) {
                    Some(mismatch) => info!(error = %mismatch, "Schema version changed, clearing all tiers"),
                    None => info!(
                        marker = %state,
                        version = self.version.current(),
                        "No usable schema marker, clearing all tiers"
                    ),
                }
                self.clear_all().await;
                if let Err(e) = self.version.commit().await {
                    warn!(error = %e, "Failed to write schema marker");
                }
            })
            .await;
    }

    async fn clear_all(&self) {
        let removed = self.remove_matching(&KeyPattern::All).await;
        debug!(removed, "Cleared all tiers");
    }

    /// Remove across tiers, logging tier failures
    async fn remove_matching(&self, pattern: &KeyPattern) -> usize {
        let mut removed = self.memory.remove_matching(pattern).await.unwrap_or(0);

        match self.persistent.remove_matching(pattern).await {
            Ok(n) => removed += n,
            Err(e) => warn!(%pattern, error = %e, "Persistent invalidation failed"),
        }
        if let Some(n) = log_structured_failure(self.structured.remove_matching(pattern).await, &pattern.to_string()) {
            removed += n;
        }
        removed
    }

    /// Fresh value from the first tier holding one, promoting upward
    async fn probe<T: Cacheable>(&self, key: &CacheKey, ttl: Duration) -> Result<Option<(CacheEntry<T>, CacheTier)>> {
        if let Some(entry) = self.memory.get::<T>(key, ttl).await? {
            return Ok(Some((entry, CacheTier::Memory)));
        }

        if let Some(entry) = self.persistent.get::<T>(key, ttl).await? {
            self.promote(key, &entry, CacheTier::Persistent).await;
            return Ok(Some((entry, CacheTier::Persistent)));
        }

        if self.structured.accepts::<T>(key) {
            if let Some(entry) = self.structured.get::<T>(key, ttl).await? {
                self.promote(key, &entry, CacheTier::Structured).await;
                return Ok(Some((entry, CacheTier::Structured)));
            }
        }

        Ok(None)
    }

    /// Value of any age, searching memory, persistent, structured in order
    async fn probe_any_age<T: Cacheable>(
        &self,
        key: &CacheKey,
        promote: bool,
    ) -> Result<Option<(CacheEntry<T>, CacheTier)>> {
        if let Some(entry) = self.memory.get_any_age::<T>(key).await? {
            return Ok(Some((entry, CacheTier::Memory)));
        }

        if let Some(entry) = self.persistent.get_any_age::<T>(key).await? {
            if promote {
                self.promote(key, &entry, CacheTier::Persistent).await;
            }
            return Ok(Some((entry, CacheTier::Persistent)));
        }

        if self.structured.accepts::<T>(key) {
            if let Some(entry) = self.structured.get_any_age::<T>(key).await? {
                if promote {
                    self.promote(key, &entry, CacheTier::Structured).await;
                }
                return Ok(Some((entry, CacheTier::Structured)));
            }
        }

        Ok(None)
    }

    /// Copy a lower-tier hit into the tiers above it, keeping `cached_at`
    async fn promote<T: Cacheable>(&self, key: &CacheKey, entry: &CacheEntry<T>, from: CacheTier) {
        if let Err(e) = self.memory.set(key, &entry.value, entry.cached_at).await {
            warn!(key = %key, error = %e, "Promotion into memory failed");
        }
        if from == CacheTier::Structured {
            if let Err(e) = self.persistent.set(key, &entry.value, entry.cached_at).await {
                warn!(key = %key, error = %e, "Promotion into persistent tier failed");
            }
        }
        self.metrics.record_promotion();
        debug!(key = %key, %from, "Promoted entry");
    }

    /// Write a value to every tier that can hold it
    async fn fan_out<T: Cacheable>(&self, key: &CacheKey, value: &T, cached_at: DateTime<Utc>) {
        if let Err(e) = self.memory.set(key, value, cached_at).await {
            warn!(key = %key, error = %e, "Memory write failed");
        }
        if let Err(e) = self.persistent.set(key, value, cached_at).await {
            warn!(key = %key, error = %e, "Persistent write failed");
        }
        if self.structured.accepts::<T>(key) {
            if let Err(e) = self.structured.set(key, value, cached_at).await {
                warn!(key = %key, error = %e, "Structured write failed");
            }
        }
    }

    /// Coalesced upstream fetch followed by fan-out. Fan-out finishes before
    /// the in-flight ticket is released.
    ///
    /// The ticket holder looks at memory once more before calling upstream:
    /// a fetch that completed between the caller's lookup and the ticket being
    /// taken has already left a fresh value there.
    async fn fetch_and_store<T, F, Fut>(
        self: &Arc<Self>,
        key: &CacheKey,
        ttl: Duration,
        fallback: F,
    ) -> Result<T>
    where
        T: Cacheable,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let inner = Arc::clone(self);
        let owned_key = key.clone();
        self.memory
            .deduplicate(key, move || async move {
                let cached = inner.memory.get_any_age::<T>(&owned_key).await.ok().flatten();
                if let Some(entry) = cached.filter(|e| e.is_fresh(ttl, inner.clock.now())) {
                    debug!(key = %owned_key, "Fresh value landed while waiting, skipping upstream");
                    return Ok::<T, anyhow::Error>(entry.value);
                }

                inner.metrics.record_fetch();
                debug!(key = %owned_key, "Fetching from upstream");
                let value = fallback().await?;
                inner.fan_out(&owned_key, &value, inner.clock.now()).await;
                Ok::<T, anyhow::Error>(value)
            })
            .await
    }

    async fn refresh<T, F, Fut>(self: &Arc<Self>, key: &CacheKey, ttl: Duration, fallback: F)
    where
        T: Cacheable,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        if !self.connectivity.is_online().await {
            debug!(key = %key, "Offline, skipping background refresh");
            return;
        }

        self.metrics.record_background_refresh();
        match self.fetch_and_store(key, ttl, fallback).await {
            Ok(_) => debug!(key = %key, "Background refresh complete"),
            Err(e) => {
                self.metrics.record_refresh_failure();
                warn!(key = %key, error = %e, "Background refresh failed, keeping stale value");
            }
        }
    }
}

/// Structured-tier deletes may be unsupported by the store; that is logged,
/// not propagated
fn log_structured_failure<T>(result: Result<T>, scope: &str) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(Error::Unsupported { .. }) => {
            debug!(scope, "Structured store does not support deletion");
            None
        }
        Err(e) => {
            warn!(scope, error = %e, "Structured invalidation failed");
            None
        }
    }
}

/// On-disk layout under a cache directory
#[derive(Debug, Clone)]
pub struct CacheLayout {
    pub root: PathBuf,
    pub entries: PathBuf,
    pub files: PathBuf,
    pub records: PathBuf,
    pub meta: PathBuf,
}

impl CacheLayout {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            entries: root.join("entries.json"),
            files: root.join("files"),
            records: root.join("records.json"),
            meta: root.join("meta.json"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::connectivity::ConnectivityFlag;
    use crate::cache::key::{keys, ScoreKind};
    use crate::cache::structured::RecordPredicate;
    use assert_matches::assert_matches;
    use chrono::{NaiveDate, TimeZone};
    use serde::Serialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const HOUR: Duration = Duration::from_secs(3600);

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct DailyAggregate {
        steps: u32,
    }

    struct Fixture {
        cache: TieredCache,
        clock: Arc<ManualClock>,
        online: Arc<ConnectivityFlag>,
        records: Arc<InMemoryRecordStore>,
        marker: Arc<InMemoryFlatStore>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(t0()));
        let online = Arc::new(ConnectivityFlag::new(true));
        let records = Arc::new(InMemoryRecordStore::new());
        let marker = Arc::new(InMemoryFlatStore::new());
        let cache = TieredCache::builder()
            .clock(clock.clone())
            .connectivity(online.clone())
            .record_store(records.clone())
            .marker_store(marker.clone())
            .build()
            .unwrap();
        cache.register::<DailyAggregate>("aggregate");
        Fixture {
            cache,
            clock,
            online,
            records,
            marker,
        }
    }

    fn counting(
        calls: &Arc<AtomicUsize>,
        value: u32,
    ) -> impl FnOnce() -> futures::future::BoxFuture<'static, anyhow::Result<u32>> + Send + 'static {
        let calls = Arc::clone(calls);
        move || {
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(value)
            })
        }
    }

    #[tokio::test]
    async fn test_in_memory_construction() {
        let cache = TieredCache::in_memory();
        assert_eq!(cache.schema_version(), CURRENT_SCHEMA_VERSION);
        assert_eq!(cache.get::<u32>(&keys::activities(1), HOUR).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_get_reports_tier() {
        let f = fixture();
        let key = keys::activities(90);
        f.cache.set(&key, 5u32).await.unwrap();

        let hit = f.cache.get_entry::<u32>(&key, HOUR).await.unwrap().unwrap();
        assert_eq!(hit.value, 5);
        assert_eq!(hit.tier, CacheTier::Memory);
        assert_eq!(hit.cached_at, t0());
    }

    #[tokio::test]
    async fn test_fetch_miss_fans_out() {
        let f = fixture();
        let key = keys::daily_aggregate(date());
        let value = f
            .cache
            .fetch(&key, HOUR, || async { Ok(DailyAggregate { steps: 9000 }) })
            .await
            .unwrap();
        assert_eq!(value.steps, 9000);

        assert!(f.cache.inner.memory.contains(&key, HOUR).await.unwrap());
        assert!(f.cache.inner.persistent.contains(&key, HOUR).await.unwrap());
        assert_eq!(f.records.len(), 1);
        assert_eq!(f.cache.statistics().fetches, 1);
    }

    #[tokio::test]
    async fn test_unregistered_type_skips_structured_tier() {
        let f = fixture();
        let key = keys::activities(90);
        f.cache.fetch(&key, HOUR, || async { Ok(1u32) }).await.unwrap();
        assert!(f.records.is_empty());
        assert!(!f.cache.is_persistable::<u32>(&key));
    }

    #[tokio::test]
    async fn test_fetch_hit_skips_fallback() {
        let f = fixture();
        let key = keys::activities(90);
        let calls = Arc::new(AtomicUsize::new(0));

        f.cache.fetch(&key, HOUR, counting(&calls, 1)).await.unwrap();
        f.clock.advance(Duration::from_secs(60));
        assert_eq!(f.cache.fetch(&key, HOUR, counting(&calls, 2)).await.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_persistent_hit_promotes_with_original_timestamp() {
        let f = fixture();
        let key = keys::activities(90);
        f.cache.set(&key, 3u32).await.unwrap();
        f.cache.inner.memory.clear();
        f.clock.advance(Duration::from_secs(600));

        let hit = f.cache.get_entry::<u32>(&key, HOUR).await.unwrap().unwrap();
        assert_eq!(hit.tier, CacheTier::Persistent);
        assert_eq!(hit.cached_at, t0());

        let hit = f.cache.get_entry::<u32>(&key, HOUR).await.unwrap().unwrap();
        assert_eq!(hit.tier, CacheTier::Memory);
        assert_eq!(hit.cached_at, t0());
        assert_eq!(f.cache.statistics().promotions, 1);
    }

    #[tokio::test]
    async fn test_promotion_into_full_memory_tier_sticks() {
        let clock = Arc::new(ManualClock::new(t0()));
        let config = CacheConfig {
            memory: EvictionPolicy {
                max_entries: 2,
                eviction_batch_size: 1,
            },
            ..CacheConfig::default()
        };
        let cache = TieredCache::builder().config(config).clock(clock.clone()).build().unwrap();

        let old = keys::activities(1);
        cache.set(&old, 1u32).await.unwrap();
        clock.advance(Duration::from_secs(10));
        cache.set(&keys::activities(2), 2u32).await.unwrap();
        clock.advance(Duration::from_secs(10));
        cache.set(&keys::activities(3), 3u32).await.unwrap();
        assert!(!cache.inner.memory.contains(&old, HOUR).await.unwrap());

        let hit = cache.get_entry::<u32>(&old, HOUR).await.unwrap().unwrap();
        assert_eq!(hit.tier, CacheTier::Persistent);
        assert_eq!(hit.cached_at, t0());
        assert!(cache.inner.memory.contains(&old, HOUR).await.unwrap());

        let hit = cache.get_entry::<u32>(&old, HOUR).await.unwrap().unwrap();
        assert_eq!(hit.tier, CacheTier::Memory);
        assert_eq!(cache.statistics().memory_entries, 2);
    }

    #[tokio::test]
    async fn test_structured_hit_promotes_into_both_tiers() {
        let f = fixture();
        let key = keys::daily_aggregate(date());
        f.cache.set(&key, DailyAggregate { steps: 1 }).await.unwrap();
        f.cache.inner.memory.clear();
        f.cache.inner.persistent.clear().await.unwrap();

        let hit = f.cache.get_entry::<DailyAggregate>(&key, HOUR).await.unwrap().unwrap();
        assert_eq!(hit.tier, CacheTier::Structured);
        assert!(f.cache.inner.memory.contains(&key, HOUR).await.unwrap());
        assert!(f.cache.inner.persistent.contains(&key, HOUR).await.unwrap());
    }

    #[tokio::test]
    async fn test_fetch_failure_serves_stale() {
        let f = fixture();
        let key = keys::activities(90);
        f.cache.set(&key, 7u32).await.unwrap();
        f.clock.advance(2 * HOUR);

        let value = f
            .cache
            .fetch(&key, HOUR, || async { Err::<u32, _>(anyhow::anyhow!("503")) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(f.cache.statistics().stale_served, 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_without_cache_returns_original_error() {
        let f = fixture();
        let err = f
            .cache
            .fetch(&keys::activities(90), HOUR, || async {
                Err::<u32, _>(anyhow::anyhow!("rate limited"))
            })
            .await
            .unwrap_err();
        assert_matches!(err, Error::Upstream(_));
        assert_eq!(err.to_string(), "rate limited");
    }

    #[tokio::test]
    async fn test_type_mismatch_surfaces() {
        let f = fixture();
        let key = keys::activities(90);
        f.cache.set(&key, "text".to_string()).await.unwrap();

        let err = f.cache.fetch(&key, HOUR, || async { Ok(1u32) }).await.unwrap_err();
        assert!(err.is_type_mismatch());
    }

    #[tokio::test]
    async fn test_cache_first_fresh_does_not_refresh() {
        let f = fixture();
        let key = keys::activities(90);
        let calls = Arc::new(AtomicUsize::new(0));
        f.cache.set(&key, 1u32).await.unwrap();

        let value = f.cache.fetch_cache_first(&key, HOUR, counting(&calls, 2)).await.unwrap();
        assert_eq!(value, 1);
        f.cache.wait_for_background().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cache_first_expired_refreshes_in_background() {
        let f = fixture();
        let key = keys::activities(90);
        let calls = Arc::new(AtomicUsize::new(0));
        f.cache.set(&key, 1u32).await.unwrap();
        f.clock.advance(2 * HOUR);

        let value = f.cache.fetch_cache_first(&key, HOUR, counting(&calls, 2)).await.unwrap();
        assert_eq!(value, 1);

        f.cache.wait_for_background().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.cache.get::<u32>(&key, HOUR).await.unwrap(), Some(2));
        assert_eq!(f.cache.statistics().background_refreshes, 1);
    }

    #[tokio::test]
    async fn test_cache_first_refresh_failure_keeps_stale() {
        let f = fixture();
        let key = keys::activities(90);
        f.cache.set(&key, 1u32).await.unwrap();
        f.clock.advance(2 * HOUR);

        let value = f
            .cache
            .fetch_cache_first(&key, HOUR, || async { Err::<u32, _>(anyhow::anyhow!("down")) })
            .await
            .unwrap();
        assert_eq!(value, 1);

        f.cache.wait_for_background().await;
        assert_eq!(f.cache.statistics().refresh_failures, 1);
        let stale = f.cache.inner.memory.get_any_age::<u32>(&key).await.unwrap().unwrap();
        assert_eq!(stale.value, 1);
    }

    #[tokio::test]
    async fn test_cache_first_offline_skips_refresh() {
        let f = fixture();
        let key = keys::activities(90);
        let calls = Arc::new(AtomicUsize::new(0));
        f.cache.set(&key, 1u32).await.unwrap();
        f.clock.advance(2 * HOUR);
        f.online.set_online(false);

        assert_eq!(f.cache.fetch_cache_first(&key, HOUR, counting(&calls, 2)).await.unwrap(), 1);
        f.cache.wait_for_background().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cache_first_offline_without_cache() {
        let f = fixture();
        let calls = Arc::new(AtomicUsize::new(0));
        f.online.set_online(false);

        let err = f
            .cache
            .fetch_cache_first(&keys::activities(90), HOUR, counting(&calls, 2))
            .await
            .unwrap_err();
        assert!(err.is_offline());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cache_first_online_without_cache_fetches() {
        let f = fixture();
        let calls = Arc::new(AtomicUsize::new(0));
        let value = f
            .cache
            .fetch_cache_first(&keys::activities(90), HOUR, counting(&calls, 4))
            .await
            .unwrap();
        assert_eq!(value, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_with_policy_uses_kind_ttl() {
        let f = fixture();
        let key = keys::samples("hrv", date()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        f.cache.fetch_with_policy(&key, counting(&calls, 1)).await.unwrap();
        f.clock.advance(Duration::from_secs(299));
        f.cache.fetch_with_policy(&key, counting(&calls, 2)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        f.clock.advance(Duration::from_secs(1));
        assert_eq!(f.cache.fetch_with_policy(&key, counting(&calls, 3)).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_fetch_with_policy_requires_rule() {
        let f = fixture();
        let key = CacheKey::parse("weather:forecast:today").unwrap();
        let err = f
            .cache
            .fetch_with_policy(&key, || async { Ok(1u32) })
            .await
            .unwrap_err();
        assert_matches!(err, Error::Config(_));
    }

    #[tokio::test]
    async fn test_invalidate_is_idempotent() {
        let f = fixture();
        let key = keys::daily_aggregate(date());
        f.cache.set(&key, DailyAggregate { steps: 1 }).await.unwrap();

        f.cache.invalidate(&key).await.unwrap();
        f.cache.invalidate(&key).await.unwrap();
        assert!(!f.cache.is_valid(&key, HOUR).await.unwrap());
        assert!(f.records.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_matching_star_empties_all_tiers() {
        let f = fixture();
        f.cache.set(&keys::activities(90), 1u32).await.unwrap();
        f.cache
            .set(&keys::daily_aggregate(date()), DailyAggregate { steps: 2 })
            .await
            .unwrap();

        let removed = f.cache.invalidate_matching("*").await.unwrap();
        assert_eq!(removed, 5);
        assert_eq!(f.cache.statistics().memory_entries, 0);
        assert!(f.cache.persisted_entries().await.unwrap().is_empty());
        assert!(f.records.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_pattern_is_rejected() {
        let f = fixture();
        assert_matches!(
            f.cache.invalidate_matching("score:(").await,
            Err(Error::InvalidPattern { .. })
        );
    }

    #[tokio::test]
    async fn test_version_guard_clears_on_first_use() {
        let f = fixture();
        f.cache
            .set(&keys::daily_aggregate(date()), DailyAggregate { steps: 1 })
            .await
            .unwrap();
        assert_eq!(f.records.len(), 1);
        assert_eq!(
            f.marker.get("cache_schema_version").await.unwrap().as_deref(),
            Some("1")
        );

        // Same stores, newer schema
        let upgraded = TieredCache::builder()
            .schema_version(CURRENT_SCHEMA_VERSION + 1)
            .record_store(f.records.clone())
            .marker_store(f.marker.clone())
            .build()
            .unwrap();
        upgraded.ensure_ready().await;
        assert!(f.records.is_empty());
        assert_eq!(
            f.marker.get("cache_schema_version").await.unwrap().as_deref(),
            Some("2")
        );
    }

    #[tokio::test]
    async fn test_default_marker_shares_the_flat_store() {
        let flat = Arc::new(InMemoryFlatStore::new());
        let key = keys::activities(30);

        let first = TieredCache::builder().flat_store(flat.clone()).build().unwrap();
        first.set(&key, 30u32).await.unwrap();

        // Same durable store, same version: entries survive the restart
        let second = TieredCache::builder().flat_store(flat.clone()).build().unwrap();
        let hit = second.get_entry::<u32>(&key, HOUR).await.unwrap().unwrap();
        assert_eq!(hit.tier, CacheTier::Persistent);

        second.invalidate_matching("*").await.unwrap();
        assert_eq!(
            flat.get("meta/cache_schema_version").await.unwrap().as_deref(),
            Some("1")
        );

        second.set(&key, 31u32).await.unwrap();
        let upgraded = TieredCache::builder()
            .flat_store(flat.clone())
            .schema_version(CURRENT_SCHEMA_VERSION + 1)
            .build()
            .unwrap();
        assert_eq!(upgraded.get::<u32>(&key, HOUR).await.unwrap(), None);
        assert_eq!(
            flat.get("meta/cache_schema_version").await.unwrap().as_deref(),
            Some("2")
        );
    }

    #[tokio::test]
    async fn test_fetch_and_store_reuses_value_landed_while_waiting() {
        let f = fixture();
        let key = keys::score(ScoreKind::Recovery, date());
        let calls = Arc::new(AtomicUsize::new(0));

        // Another caller's fetch completed after this one missed its lookup
        f.cache.set(&key, 72u32).await.unwrap();
        let value = f.cache.inner.fetch_and_store(&key, HOUR, counting(&calls, 99)).await.unwrap();
        assert_eq!(value, 72);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.cache.statistics().fetches, 0);

        f.clock.advance(HOUR);
        let value = f.cache.inner.fetch_and_store(&key, HOUR, counting(&calls, 99)).await.unwrap();
        assert_eq!(value, 99);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_set_foreign() {
        let f = fixture();
        let key = CacheKey::parse("wellness:raw:2025-01-01").unwrap();
        let value = ForeignValue::Dictionary(vec![
            (ForeignValue::String("hr".to_string()), ForeignValue::Integer(60)),
            (ForeignValue::String("bad".to_string()), ForeignValue::Float(f64::NAN)),
        ]);

        assert_matches!(
            f.cache.set_foreign(&key, &value, LeafPolicy::Reject).await,
            Err(Error::Unencodable { .. })
        );

        let skipped = f.cache.set_foreign(&key, &value, LeafPolicy::Skip).await.unwrap();
        assert_eq!(skipped, vec!["$.bad"]);
        let stored = f.cache.get::<serde_json::Value>(&key, HOUR).await.unwrap().unwrap();
        assert_eq!(stored, serde_json::json!({ "hr": 60 }));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let f = fixture();
        f.cache
            .set(&keys::daily_aggregate(date()), DailyAggregate { steps: 2 })
            .await
            .unwrap();
        f.clock.advance(Duration::from_secs(48 * 3600));

        assert_eq!(f.cache.purge_expired().await.unwrap(), 1);
        assert!(f
            .records
            .fetch(&RecordPredicate::All)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_reset_statistics() {
        let f = fixture();
        let key = keys::activities(1);
        f.cache.fetch(&key, HOUR, || async { Ok(1u32) }).await.unwrap();
        f.cache.get::<u32>(&key, HOUR).await.unwrap();
        assert!(f.cache.statistics().total_hits() > 0);

        f.cache.reset_statistics();
        let stats = f.cache.statistics();
        assert_eq!(stats.total_hits(), 0);
        assert_eq!(stats.fetches, 0);
        assert_eq!(stats.memory_entries, 1);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_refresh() {
        let f = fixture();
        let key = keys::score(ScoreKind::Sleep, date());
        f.cache.set(&key, 1u32).await.unwrap();
        f.clock.advance(Duration::from_secs(49 * 3600));

        let value = f
            .cache
            .fetch_cache_first(&key, HOUR, || async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(2u32)
            })
            .await
            .unwrap();
        assert_eq!(value, 1);

        tokio::time::timeout(Duration::from_secs(5), f.cache.shutdown())
            .await
            .expect("shutdown does not wait for the upstream");
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
memory:
  max_entries: 50
persistent:
  size_threshold: 1024
schema_version: 4
ttl_policy:
  rules:
    - domain: strava
      ttl_seconds: 60
"#;
        let config = CacheConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.memory.max_entries, 50);
        assert_eq!(config.memory.eviction_batch_size, 50);
        assert_eq!(config.persistent.size_threshold, 1024);
        assert_eq!(config.schema_version, 4);
        assert_eq!(
            config.ttl_policy.ttl_for(&keys::activities(1)),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_config_defaults_and_validation() {
        let config = CacheConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, CacheConfig::default());

        assert_matches!(
            CacheConfig::from_yaml_str("memory:\n  max_entries: 0\n"),
            Err(Error::Config(_))
        );
    }
}
