//! Persistent Layer - durable key-value tier
//!
//! Stores each value as a [`VersionedEnvelope`]. Values whose encoded payload
//! is below `size_threshold` go into a [`FlatStore`] as base64 text; larger
//! ones go into a [`FileStore`] under a filesystem-safe name derived from the
//! key.
//! A key lives in exactly one of the two at a time.
//!
//! # Read path
//!
//! ```text
//! bytes ──▶ envelope? ──yes──▶ schema == current? ──no──▶ delete, miss
//!              │                      │yes
//!              no                     ▼
//!              ▼               payload decodes? ──no──▶ delete, miss
//!       legacy format?                │yes
//!         │yes    │no                 ▼
//!         ▼       └──▶ delete, miss  hit
//!        hit
//! ```
//!
//! Storage errors are logged and reported as misses.

use std::any::type_name;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use super::clock::{Clock, SystemClock};
use super::entry::{decode_legacy, is_within_ttl, CacheEntry, Cacheable, EnvelopeHeader, VersionedEnvelope};
use super::key::{CacheKey, KeyPattern};
use super::layer::{CacheLayer, CacheTier};
use super::stats::{LayerStats, LayerStatsSnapshot};
use super::storage::{FileStore, FlatStore, InMemoryFileStore, InMemoryFlatStore};
use super::version::CURRENT_SCHEMA_VERSION;
use crate::error::Result;

/// Suffix of every entry file
const FILE_SUFFIX: &str = ".entry";

/// Longest file name produced before falling back to a hashed name
const MAX_FILE_NAME_LEN: usize = 200;

/// Persistent layer configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PersistentConfig {
    /// Values whose encoded payload is smaller than this go to the flat store
    pub size_threshold: usize,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            size_threshold: 50 * 1024,
        }
    }
}

/// Where a persisted entry lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMechanism {
    /// Base64 text in the flat store
    Flat,
    /// Standalone file
    File,
}

impl StorageMechanism {
    pub fn name(&self) -> &'static str {
        match self {
            StorageMechanism::Flat => "flat",
            StorageMechanism::File => "file",
        }
    }
}

/// Diagnostic view of one persisted entry
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedEntry {
    /// Key, or the file name if the key cannot be recovered
    pub key: String,
    pub mechanism: StorageMechanism,
    /// Envelope header, `None` for legacy or unreadable entries
    pub header: Option<EnvelopeHeader>,
    /// Stored size in bytes
    pub size: usize,
}

/// File name for a key: `k-<urlencoded>.entry`, or `h-<fingerprint>.entry`
/// when the encoded name would be too long
pub fn file_name_for(key: &CacheKey) -> String {
    let name = format!("k-{}{FILE_SUFFIX}", urlencoding::encode(key.as_str()));
    if name.len() <= MAX_FILE_NAME_LEN {
        name
    } else {
        format!("h-{:016x}{FILE_SUFFIX}", key.fingerprint())
    }
}

/// Key string encoded in a `k-` file name. Hashed names return `None`.
pub fn key_from_file_name(name: &str) -> Option<String> {
    let encoded = name.strip_prefix("k-")?.strip_suffix(FILE_SUFFIX)?;
    urlencoding::decode(encoded).ok().map(|k| k.into_owned())
}

/// Flat-store keys that are not cache keys belong to other namespaces
/// sharing the store (e.g. the schema marker) and are left alone
fn is_entry_key(key: &str) -> bool {
    CacheKey::parse(key).is_ok()
}

fn is_entry_file(name: &str) -> bool {
    (name.starts_with("k-") || name.starts_with("h-")) && name.ends_with(FILE_SUFFIX)
}

/// Persistent Layer
pub struct PersistentLayer {
    flat: Arc<dyn FlatStore>,
    files: Arc<dyn FileStore>,
    config: PersistentConfig,
    schema_version: u32,
    clock: Arc<dyn Clock>,
    stats: LayerStats,
}

impl PersistentLayer {
    /// Create a persistent layer over the given stores
    pub fn new(flat: Arc<dyn FlatStore>, files: Arc<dyn FileStore>) -> Self {
        Self {
            flat,
            files,
            config: PersistentConfig::default(),
            schema_version: CURRENT_SCHEMA_VERSION,
            clock: Arc::new(SystemClock),
            stats: LayerStats::new(),
        }
    }

    /// Persistent layer backed by in-memory stores
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryFlatStore::new()),
            Arc::new(InMemoryFileStore::new()),
        )
    }

    pub fn with_config(mut self, config: PersistentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_schema_version(mut self, schema_version: u32) -> Self {
        self.schema_version = schema_version;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn config(&self) -> &PersistentConfig {
        &self.config
    }

    /// Raw envelope bytes and where they came from. With `repair`, a flat
    /// value that is not base64 is deleted.
    async fn load(&self, key: &CacheKey, repair: bool) -> Option<(StorageMechanism, Vec<u8>)> {
        match self.flat.get(key.as_str()).await {
            Ok(Some(encoded)) => match STANDARD.decode(encoded.as_bytes()) {
                Ok(bytes) => return Some((StorageMechanism::Flat, bytes)),
                Err(e) => {
                    debug!(key = %key, error = %e, "Flat store value is not base64");
                    if repair {
                        self.discard(key).await;
                    }
                    return None;
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!(key = %key, error = %e, "Flat store read failed");
                return None;
            }
        }

        match self.files.read(&file_name_for(key)).await {
            Ok(Some(bytes)) => Some((StorageMechanism::File, bytes)),
            Ok(None) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "Entry file read failed");
                None
            }
        }
    }

    /// Decode stored bytes, deleting anything unreadable
    async fn decode<T: Cacheable>(&self, key: &CacheKey, bytes: &[u8]) -> Option<CacheEntry<T>> {
        match VersionedEnvelope::from_bytes(bytes) {
            Ok(envelope) => {
                if envelope.schema_version != self.schema_version {
                    debug!(
                        key = %key,
                        stored = envelope.schema_version,
                        current = self.schema_version,
                        "Discarding entry from another schema version"
                    );
                    self.discard(key).await;
                    return None;
                }
                if envelope.key != key.as_str() {
                    // Hashed file name shared with another key
                    debug!(key = %key, stored_key = %envelope.key, "Entry belongs to another key");
                    return None;
                }
                match serde_json::from_slice::<T>(&envelope.payload) {
                    Ok(value) => Some(CacheEntry::new(value, envelope.cached_at)),
                    Err(e) => {
                        debug!(
                            key = %key,
                            expected = type_name::<T>(),
                            declared = %envelope.declared_type,
                            error = %e,
                            "Payload failed to decode, deleting"
                        );
                        self.discard(key).await;
                        None
                    }
                }
            }
            Err(_) => match decode_legacy::<T>(bytes) {
                Some((format, entry)) => {
                    debug!(key = %key, format = format.name(), "Read entry in legacy format");
                    Some(entry)
                }
                None => {
                    debug!(key = %key, "Entry is in no known format, deleting");
                    self.discard(key).await;
                    None
                }
            },
        }
    }

    async fn read_entry<T: Cacheable>(&self, key: &CacheKey) -> Option<CacheEntry<T>> {
        let (_, bytes) = self.load(key, true).await?;
        self.decode(key, &bytes).await
    }

    /// Best-effort delete used on the read path
    async fn discard(&self, key: &CacheKey) {
        if let Err(e) = self.remove(key).await {
            warn!(key = %key, error = %e, "Failed to delete unreadable entry");
        }
    }

    /// Key behind a stored file name, reading the header for hashed names
    async fn key_for_file(&self, name: &str) -> Option<String> {
        if let Some(key) = key_from_file_name(name) {
            return Some(key);
        }
        let bytes = self.files.read(name).await.ok()??;
        EnvelopeHeader::from_bytes(&bytes).ok().map(|h| h.key)
    }

    /// Every persisted entry with its envelope header
    pub async fn list_entries(&self) -> Result<Vec<PersistedEntry>> {
        let mut entries = Vec::new();

        for key in self.flat.keys().await? {
            if !is_entry_key(&key) {
                continue;
            }
            let Some(encoded) = self.flat.get(&key).await? else {
                continue;
            };
            let bytes = STANDARD.decode(encoded.as_bytes()).unwrap_or_default();
            entries.push(PersistedEntry {
                key,
                mechanism: StorageMechanism::Flat,
                header: EnvelopeHeader::from_bytes(&bytes).ok(),
                size: bytes.len(),
            });
        }

        for name in self.files.list().await? {
            if !is_entry_file(&name) {
                continue;
            }
            let Some(bytes) = self.files.read(&name).await? else {
                continue;
            };
            let header = EnvelopeHeader::from_bytes(&bytes).ok();
            let key = header
                .as_ref()
                .map(|h| h.key.clone())
                .or_else(|| key_from_file_name(&name))
                .unwrap_or(name);
            entries.push(PersistedEntry {
                key,
                mechanism: StorageMechanism::File,
                header,
                size: bytes.len(),
            });
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    /// Remove every entry
    pub async fn clear(&self) -> Result<usize> {
        self.remove_matching(&KeyPattern::All).await
    }
}

#[async_trait]
impl CacheLayer for PersistentLayer {
    fn tier(&self) -> CacheTier {
        CacheTier::Persistent
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
        let envelope = VersionedEnvelope {
            schema_version: self.schema_version,
            declared_type: type_name::<T>().to_string(),
            key: key.to_string(),
            cached_at,
            payload: serde_json::to_vec(value)?,
        };
        let use_flat = envelope.payload.len() < self.config.size_threshold;
        let bytes = envelope.to_bytes()?;
        let file_name = file_name_for(key);

        if use_flat {
            self.flat.put(key.as_str(), STANDARD.encode(&bytes)).await?;
            self.files.delete(&file_name).await?;
        } else {
            self.files.write(&file_name, &bytes).await?;
            self.flat.delete(key.as_str()).await?;
        }

        self.stats.record_set();
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<()> {
        self.flat.delete(key.as_str()).await?;
        self.files.delete(&file_name_for(key)).await?;
        Ok(())
    }

    async fn remove_matching(&self, pattern: &KeyPattern) -> Result<usize> {
        let mut removed = 0;

        for key in self.flat.keys().await? {
            if is_entry_key(&key) && pattern.matches_str(&key) && self.flat.delete(&key).await? {
                removed += 1;
            }
        }

        for name in self.files.list().await? {
            if !is_entry_file(&name) {
                continue;
            }
            let matched = match pattern {
                KeyPattern::All => true,
                _ => match self.key_for_file(&name).await {
                    Some(key) => pattern.matches_str(&key),
                    None => false,
                },
            };
            if matched && self.files.delete(&name).await? {
                removed += 1;
            }
        }

        Ok(removed)
    }

    async fn contains(&self, key: &CacheKey, ttl: Duration) -> Result<bool> {
        let Some((_, bytes)) = self.load(key, false).await else {
            return Ok(false);
        };
        let now = self.clock.now();

        let cached_at = match EnvelopeHeader::from_bytes(&bytes) {
            Ok(header) => {
                if header.schema_version != self.schema_version || header.key != key.as_str() {
                    return Ok(false);
                }
                header.cached_at
            }
            Err(_) => match decode_legacy::<serde_json::Value>(&bytes) {
                Some((_, entry)) => entry.cached_at,
                None => return Ok(false),
            },
        };
        Ok(is_within_ttl(cached_at, ttl, now))
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
