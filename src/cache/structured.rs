//! Structured Layer - typed record tier
//!
//! Longer-lived, queryable persistence for domain records (daily aggregates,
//! scores). The store holds heterogeneous record shapes, so reads go through
//! a bounded type registry keyed by the key's `kind` segment:
//!
//! 1. Look up the type registered for the kind
//! 2. Proceed only if it is the caller's type
//! 3. Decode, then trust
//!
//! Unregistered kinds and registry mismatches are misses, not errors.

use std::any::{type_name, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::clock::{Clock, SystemClock};
use super::entry::{is_within_ttl, CacheEntry, Cacheable};
use super::key::{CacheKey, KeyPattern};
use super::layer::{CacheLayer, CacheTier};
use super::policy::TtlPolicy;
use super::stats::{LayerStats, LayerStatsSnapshot};
use super::storage::write_atomic;
use super::version::CURRENT_SCHEMA_VERSION;
use crate::error::{Error, Result};

/// One record in the structured store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub key: String,
    pub kind: String,
    pub type_name: String,
    pub schema_version: u32,
    pub cached_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Predicate for record fetch and delete
#[derive(Debug, Clone)]
pub enum RecordPredicate {
    /// Exact key
    Key(String),
    /// Every record of a kind
    Kind(String),
    /// Keys matching a pattern
    Matching(KeyPattern),
    /// Every record
    All,
}

impl RecordPredicate {
    pub fn matches(&self, record: &StoredRecord) -> bool {
        match self {
            RecordPredicate::Key(key) => record.key == *key,
            RecordPredicate::Kind(kind) => record.kind == *kind,
            RecordPredicate::Matching(pattern) => pattern.matches_str(&record.key),
            RecordPredicate::All => true,
        }
    }
}

/// Structured record store
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or replace the record with the same key
    async fn upsert(&self, record: StoredRecord) -> Result<()>;

    /// Records matching a predicate
    async fn fetch(&self, predicate: &RecordPredicate) -> Result<Vec<StoredRecord>>;

    /// Delete matching records. Stores without deletion keep this default.
    async fn delete(&self, _predicate: &RecordPredicate) -> Result<usize> {
        Err(Error::Unsupported {
            layer: "structured",
            operation: "delete",
        })
    }
}

// =============================================================================
// Record Store Backends
// =============================================================================

/// In-memory record store for testing
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: DashMap<String, StoredRecord>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn upsert(&self, record: StoredRecord) -> Result<()> {
        self.records.insert(record.key.clone(), record);
        Ok(())
    }

    async fn fetch(&self, predicate: &RecordPredicate) -> Result<Vec<StoredRecord>> {
        if let RecordPredicate::Key(key) = predicate {
            return Ok(self.records.get(key).map(|r| r.value().clone()).into_iter().collect());
        }
        Ok(self
            .records
            .iter()
            .filter(|r| predicate.matches(r.value()))
            .map(|r| r.value().clone())
            .collect())
    }

    async fn delete(&self, predicate: &RecordPredicate) -> Result<usize> {
        let before = self.records.len();
        self.records.retain(|_, record| !predicate.matches(record));
        Ok(before - self.records.len())
    }
}

/// Record store persisted as one JSON file
pub struct JsonFileRecordStore {
    path: PathBuf,
    records: RwLock<BTreeMap<String, StoredRecord>>,
    writer: tokio::sync::Mutex<()>,
}

impl JsonFileRecordStore {
    /// Open a store, loading the file if it exists. A corrupt file starts
    /// empty.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Record store file is corrupt, starting empty");
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            records: RwLock::new(records),
            writer: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.writer.lock().await;
        let bytes = {
            let records = self.records.read();
            serde_json::to_vec_pretty(&*records)?
        };
        write_atomic(&self.path, &bytes).await
    }
}

#[async_trait]
impl RecordStore for JsonFileRecordStore {
    async fn upsert(&self, record: StoredRecord) -> Result<()> {
        self.records.write().insert(record.key.clone(), record);
        self.persist().await
    }

    async fn fetch(&self, predicate: &RecordPredicate) -> Result<Vec<StoredRecord>> {
        let records = self.records.read();
        if let RecordPredicate::Key(key) = predicate {
            return Ok(records.get(key).cloned().into_iter().collect());
        }
        Ok(records
            .values()
            .filter(|r| predicate.matches(r))
            .cloned()
            .collect())
    }

    async fn delete(&self, predicate: &RecordPredicate) -> Result<usize> {
        let removed = {
            let mut records = self.records.write();
            let before = records.len();
            records.retain(|_, record| !predicate.matches(record));
            before - records.len()
        };
        if removed > 0 {
            self.persist().await?;
        }
        Ok(removed)
    }
}

// =============================================================================
// Structured Layer
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Registration {
    type_id: TypeId,
    type_name: &'static str,
}

/// Structured Layer
pub struct StructuredLayer {
    store: Arc<dyn RecordStore>,
    /// Key kind → the one type stored under it
    registry: RwLock<HashMap<String, Registration>>,
    schema_version: u32,
    clock: Arc<dyn Clock>,
    stats: LayerStats,
}

impl StructuredLayer {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            registry: RwLock::new(HashMap::new()),
            schema_version: CURRENT_SCHEMA_VERSION,
            clock: Arc::new(SystemClock),
            stats: LayerStats::new(),
        }
    }

    /// Structured layer over an in-memory store
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryRecordStore::new()))
    }

    pub fn with_schema_version(mut self, schema_version: u32) -> Self {
        self.schema_version = schema_version;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register `T` as the record type for keys of `kind`. Re-registering a
    /// kind replaces the previous type.
    pub fn register<T: Cacheable>(&self, kind: &str) -> &Self {
        let previous = self.registry.write().insert(
            kind.to_string(),
            Registration {
                type_id: TypeId::of::<T>(),
                type_name: type_name::<T>(),
            },
        );
        if let Some(previous) = previous.filter(|p| p.type_id != TypeId::of::<T>()) {
            warn!(kind, previous = previous.type_name, new = type_name::<T>(), "Record type replaced");
        }
        self
    }

    /// Whether values of `T` are persistable under `key`
    pub fn accepts<T: Cacheable>(&self, key: &CacheKey) -> bool {
        self.registry
            .read()
            .get(key.kind())
            .map_or(false, |r| r.type_id == TypeId::of::<T>())
    }

    /// Registered kinds and their type names
    pub fn registered_kinds(&self) -> Vec<(String, &'static str)> {
        let mut kinds: Vec<_> = self
            .registry
            .read()
            .iter()
            .map(|(kind, r)| (kind.clone(), r.type_name))
            .collect();
        kinds.sort();
        kinds
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Every stored record, undecoded
    pub async fn list_records(&self) -> Result<Vec<StoredRecord>> {
        self.store.fetch(&RecordPredicate::All).await
    }

    /// Delete records whose TTL under `policy` has passed. Kinds without a
    /// policy rule are kept.
    pub async fn purge_expired(&self, policy: &TtlPolicy) -> Result<usize> {
        let now = self.clock.now();
        let mut purged = 0;

        for record in self.store.fetch(&RecordPredicate::All).await? {
            let Ok(key) = CacheKey::parse(record.key.as_str()) else {
                continue;
            };
            let Some(ttl) = policy.ttl_for(&key) else {
                continue;
            };
            if !is_within_ttl(record.cached_at, ttl, now) {
                purged += self.store.delete(&RecordPredicate::Key(record.key)).await?;
            }
        }

        if purged > 0 {
            debug!(purged, "Purged expired structured records");
        }
        Ok(purged)
    }

    /// Remove every record
    pub async fn clear(&self) -> Result<usize> {
        self.store.delete(&RecordPredicate::All).await
    }

    async fn fetch_one(&self, key: &CacheKey) -> Option<StoredRecord> {
        match self.store.fetch(&RecordPredicate::Key(key.to_string())).await {
            Ok(records) => records.into_iter().next(),
            Err(e) => {
                warn!(key = %key, error = %e, "Record store fetch failed");
                None
            }
        }
    }

    /// Best-effort delete on the read path
    async fn discard(&self, key: &CacheKey) {
        match self.store.delete(&RecordPredicate::Key(key.to_string())).await {
            Ok(_) => {}
            Err(Error::Unsupported { .. }) => {
                debug!(key = %key, "Record store cannot delete, leaving rejected record")
            }
            Err(e) => warn!(key = %key, error = %e, "Failed to delete rejected record"),
        }
    }

    async fn read_entry<T: Cacheable>(&self, key: &CacheKey) -> Option<CacheEntry<T>> {
        if !self.accepts::<T>(key) {
            return None;
        }
        let record = self.fetch_one(key).await?;

        if record.schema_version != self.schema_version {
            debug!(
                key = %key,
                stored = record.schema_version,
                current = self.schema_version,
                "Discarding record from another schema version"
            );
            self.discard(key).await;
            return None;
        }

        match serde_json::from_value::<T>(record.payload) {
            Ok(value) => Some(CacheEntry::new(value, record.cached_at)),
            Err(e) => {
                debug!(key = %key, expected = type_name::<T>(), error = %e, "Record failed to decode");
                self.discard(key).await;
                None
            }
        }
    }
}

#[async_trait]
impl CacheLayer for StructuredLayer {
    fn tier(&self) -> CacheTier {
        CacheTier::Structured
    }

    async fn get<T: Cacheable>(&self, key: &CacheKey, ttl: Duration) -> Result<Option<CacheEntry<T>>> {
        let now = self.clock.now();
        let entry = self
            .read_entry::<T>(key)
            .await
            .filter(|e| e.is_fresh(ttl, now));
        match entry {
            Some(_) => self.stats.record_hit(),
            None => self.stats.record_miss(),
        }
        Ok(entry)
    }

    async fn get_any_age<T: Cacheable>(&self, key: &CacheKey) -> Result<Option<CacheEntry<T>>> {
        Ok(self.read_entry(key).await)
    }

    async fn set<T: Cacheable>(&self, key: &CacheKey, value: &T, cached_at: DateTime<Utc>) -> Result<()> {
        if !self.accepts::<T>(key) {
            return Err(Error::Unsupported {
                layer: "structured",
                operation: "set for an unregistered record type",
            });
        }

        self.store
            .upsert(StoredRecord {
                key: key.to_string(),
                kind: key.kind().to_string(),
                type_name: type_name::<T>().to_string(),
                schema_version: self.schema_version,
                cached_at,
                payload: serde_json::to_value(value)?,
            })
            .await?;
        self.stats.record_set();
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<()> {
        self.store
            .delete(&RecordPredicate::Key(key.to_string()))
            .await
            .map(|_| ())
    }

    async fn remove_matching(&self, pattern: &KeyPattern) -> Result<usize> {
        let predicate = match pattern {
            KeyPattern::All => RecordPredicate::All,
            _ => RecordPredicate::Matching(pattern.clone()),
        };
        self.store.delete(&predicate).await
    }

    async fn contains(&self, key: &CacheKey, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        Ok(self.fetch_one(key).await.map_or(false, |record| {
            record.schema_version == self.schema_version && is_within_ttl(record.cached_at, ttl, now)
        }))
    }

    fn stats(&self) -> LayerStatsSnapshot {
        self.stats.snapshot()
    }

    fn reset_stats(&self) {
        self.stats.reset();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::key::{keys, ScoreKind};
    use assert_matches::assert_matches;
    use chrono::{NaiveDate, TimeZone};
    use tempfile::TempDir;

    const DAY: Duration = Duration::from_secs(24 * 3600);

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct DailyAggregate {
        steps: u32,
        resting_hr: f64,
    }

    fn aggregate() -> DailyAggregate {
        DailyAggregate {
            steps: 12_000,
            resting_hr: 52.5,
        }
    }

    fn layer() -> (StructuredLayer, Arc<InMemoryRecordStore>, Arc<ManualClock>) {
        let store = Arc::new(InMemoryRecordStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let layer = StructuredLayer::new(store.clone()).with_clock(clock.clone());
        layer.register::<DailyAggregate>("aggregate");
        layer.register::<f64>("recovery");
        (layer, store, clock)
    }

    /// Store that cannot delete
    #[derive(Default)]
    struct AppendOnlyStore {
        inner: InMemoryRecordStore,
    }

    #[async_trait]
    impl RecordStore for AppendOnlyStore {
        async fn upsert(&self, record: StoredRecord) -> Result<()> {
            self.inner.upsert(record).await
        }

        async fn fetch(&self, predicate: &RecordPredicate) -> Result<Vec<StoredRecord>> {
            self.inner.fetch(predicate).await
        }
    }

    #[tokio::test]
    async fn test_registered_type_round_trip() {
        let (layer, store, _) = layer();
        let key = keys::daily_aggregate(date());

        layer.set(&key, &aggregate(), t0()).await.unwrap();
        assert_eq!(store.len(), 1);

        let entry = layer.get::<DailyAggregate>(&key, DAY).await.unwrap().unwrap();
        assert_eq!(entry.value, aggregate());
        assert_eq!(entry.cached_at, t0());
    }

    #[tokio::test]
    async fn test_acceptance_follows_registry() {
        let (layer, _, _) = layer();
        let key = keys::daily_aggregate(date());

        assert!(layer.accepts::<DailyAggregate>(&key));
        assert!(!layer.accepts::<String>(&key));
        assert!(!layer.accepts::<DailyAggregate>(&keys::activities(90)));
    }

    #[tokio::test]
    async fn test_wrong_type_is_a_miss() {
        let (layer, _, _) = layer();
        let key = keys::daily_aggregate(date());
        layer.set(&key, &aggregate(), t0()).await.unwrap();

        assert!(layer.get::<String>(&key, DAY).await.unwrap().is_none());
        // The record is left for its real type
        assert!(layer.get::<DailyAggregate>(&key, DAY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unregistered_set_is_unsupported() {
        let (layer, _, _) = layer();
        let err = layer
            .set(&keys::activities(90), &vec![1u32], t0())
            .await
            .unwrap_err();
        assert_matches!(err, Error::Unsupported { layer: "structured", .. });
    }

    #[tokio::test]
    async fn test_ttl_and_contains() {
        let (layer, _, clock) = layer();
        let key = keys::score(ScoreKind::Recovery, date());
        layer.set(&key, &72.0f64, t0()).await.unwrap();

        assert!(layer.contains(&key, DAY).await.unwrap());
        clock.advance(DAY);
        assert!(!layer.contains(&key, DAY).await.unwrap());
        assert!(layer.get::<f64>(&key, DAY).await.unwrap().is_none());
        assert_eq!(layer.get_any_age::<f64>(&key).await.unwrap().unwrap().value, 72.0);
    }

    #[tokio::test]
    async fn test_schema_mismatch_deletes_record() {
        let (layer, store, clock) = layer();
        let key = keys::daily_aggregate(date());
        layer.set(&key, &aggregate(), t0()).await.unwrap();

        let newer = StructuredLayer::new(store.clone())
            .with_schema_version(CURRENT_SCHEMA_VERSION + 1)
            .with_clock(clock);
        newer.register::<DailyAggregate>("aggregate");

        assert!(newer.get::<DailyAggregate>(&key, DAY).await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_schema_mismatch_tolerates_append_only_store() {
        let store = Arc::new(AppendOnlyStore::default());
        let old = StructuredLayer::new(store.clone());
        old.register::<f64>("recovery");
        let key = keys::score(ScoreKind::Recovery, date());
        old.set(&key, &60.0f64, Utc::now()).await.unwrap();

        let newer = StructuredLayer::new(store.clone()).with_schema_version(CURRENT_SCHEMA_VERSION + 1);
        newer.register::<f64>("recovery");
        assert!(newer.get::<f64>(&key, DAY).await.unwrap().is_none());

        assert_matches!(newer.remove(&key).await, Err(Error::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_remove_matching() {
        let (layer, store, _) = layer();
        for day in 1..=3 {
            let d = NaiveDate::from_ymd_opt(2025, 1, day).unwrap();
            layer.set(&keys::daily_aggregate(d), &aggregate(), t0()).await.unwrap();
        }
        layer
            .set(&keys::score(ScoreKind::Recovery, date()), &1.0f64, t0())
            .await
            .unwrap();

        let removed = layer
            .remove_matching(&KeyPattern::new("daily:.*").unwrap())
            .await
            .unwrap();
        assert_eq!(removed, 3);
        assert_eq!(store.len(), 1);

        assert_eq!(layer.remove_matching(&KeyPattern::All).await.unwrap(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_purge_expired_by_policy() {
        let (layer, store, clock) = layer();
        layer.set(&keys::daily_aggregate(date()), &aggregate(), t0()).await.unwrap();
        clock.advance(Duration::from_secs(47 * 3600));
        layer
            .set(&keys::score(ScoreKind::Recovery, date()), &1.0f64, clock.now())
            .await
            .unwrap();
        clock.advance(Duration::from_secs(3600));

        // daily:* is 48h old, score:* only 1h
        let purged = layer.purge_expired(&TtlPolicy::default()).await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.len(), 1);
        assert!(layer.list_records().await.unwrap()[0].key.starts_with("score:"));
    }

    #[tokio::test]
    async fn test_json_file_record_store_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.json");
        let key = keys::daily_aggregate(date());

        {
            let layer = StructuredLayer::new(Arc::new(JsonFileRecordStore::open(&path).await.unwrap()));
            layer.register::<DailyAggregate>("aggregate");
            layer.set(&key, &aggregate(), Utc::now()).await.unwrap();
        }

        let store = JsonFileRecordStore::open(&path).await.unwrap();
        let records = store.fetch(&RecordPredicate::Kind("aggregate".to_string())).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, key.as_str());
        assert_eq!(store.delete(&RecordPredicate::All).await.unwrap(), 1);
    }

    #[test]
    fn test_registered_kinds() {
        let (layer, _, _) = layer();
        let kinds = layer.registered_kinds();
        assert_eq!(kinds.len(), 2);
        assert_eq!(kinds[0].0, "aggregate");
    }
}
