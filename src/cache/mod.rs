//! Tiered Cache
//!
//! Typed values served from memory, a persistent key-value tier and a
//! structured record tier, with one upstream fetch per key in flight.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          TieredCache                                      │
//! │        version guard ─▶ probe ─▶ coalesced fetch ─▶ fan-out               │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  Memory              │ Persistent           │ Structured                 │
//! │  ┌────────────────┐  │ ┌─────────────────┐  │ ┌──────────────────────┐   │
//! │  │ Any + TypeId   │  │ │ Envelope        │  │ │ StoredRecord         │   │
//! │  │ in-flight map  │  │ │ < 50KiB: flat   │  │ │ kind → type registry │   │
//! │  │ 200 entries    │  │ │ ≥ 50KiB: files  │  │ │                      │   │
//! │  └────────────────┘  │ └─────────────────┘  │ └──────────────────────┘   │
//! │         ▲            │          ▲           │                            │
//! │         └────────────┴──────────┴── promotion (keeps cached_at) ─────────│
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Freshness
//!
//! An entry is fresh while `now - cached_at < ttl`. Expired entries are
//! kept so a failed upstream fetch can still be answered from cache.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tiercache::cache::{keys, TieredCache};
//!
//! # async fn run() -> tiercache::Result<()> {
//! let cache = TieredCache::in_memory();
//! let activities: Vec<String> = cache
//!     .fetch(&keys::activities(90), Duration::from_secs(3600), || async {
//!         Ok(vec!["Morning Ride".to_string()])
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod clock;
mod connectivity;
mod entry;
mod layer;
mod manager;
mod memory;
mod persistent;
mod policy;
mod stats;
mod structured;
mod version;
pub mod codec;
pub mod key;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{ForeignValue, LeafPolicy, Normalized};
pub use connectivity::{AlwaysOnline, Connectivity, ConnectivityFlag};
pub use entry::{CacheEntry, Cacheable, EnvelopeHeader, LegacyFormat, VersionedEnvelope};
pub use key::{keys, CacheKey, KeyDomain, KeyPattern, ScoreKind};
pub use layer::{CacheLayer, CacheTier};
pub use manager::{CacheConfig, CacheHit, CacheLayout, TieredCache, TieredCacheBuilder};
pub use memory::MemoryLayer;
pub use persistent::{PersistedEntry, PersistentConfig, PersistentLayer, StorageMechanism};
pub use policy::{EvictionPolicy, TtlPolicy, TtlRule};
pub use stats::{CacheStatistics, LayerStatsSnapshot};
pub use storage::{
    DirFileStore, FileStore, FlatStore, InMemoryFileStore, InMemoryFlatStore, JsonFileFlatStore, NamespacedFlatStore,
};
pub use structured::{
    InMemoryRecordStore, JsonFileRecordStore, RecordPredicate, RecordStore, StoredRecord, StructuredLayer,
};
pub use version::{MarkerState, VersionGuard, CURRENT_SCHEMA_VERSION};
