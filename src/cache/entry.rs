//! Cache Entry Types
//!
//! [`CacheEntry`] is what every layer hands back; [`VersionedEnvelope`] is the
//! on-disk wrapper written by the persistent layer.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Values that can live in every tier
pub trait Cacheable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// A cached value together with the time it was produced
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub value: T,
    pub cached_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, cached_at: DateTime<Utc>) -> Self {
        Self { value, cached_at }
    }

    /// Age relative to `now` (negative ages clamp to zero)
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.cached_at)
            .to_std()
            .unwrap_or_default()
    }

    /// `now - cached_at < ttl`
    pub fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        is_within_ttl(self.cached_at, ttl, now)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheEntry<U> {
        CacheEntry {
            value: f(self.value),
            cached_at: self.cached_at,
        }
    }
}

/// TTL check shared by every layer. The boundary is exclusive: an entry is
/// expired at exactly `cached_at + ttl`.
pub fn is_within_ttl(cached_at: DateTime<Utc>, ttl: Duration, now: DateTime<Utc>) -> bool {
    match chrono::Duration::from_std(ttl) {
        Ok(ttl) => now.signed_duration_since(cached_at) < ttl,
        // TTL beyond chrono's range never expires
        Err(_) => true,
    }
}

// =============================================================================
// Versioned Envelope
// =============================================================================

/// Versioned wrapper around a persisted payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedEnvelope {
    pub schema_version: u32,
    /// Informational only, never used for dispatch
    pub declared_type: String,
    pub key: String,
    pub cached_at: DateTime<Utc>,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

/// Envelope metadata without the payload
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EnvelopeHeader {
    pub schema_version: u32,
    pub declared_type: String,
    pub key: String,
    pub cached_at: DateTime<Utc>,
}

impl VersionedEnvelope {
    pub fn to_bytes(&self) -> crate::error::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::error::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl EnvelopeHeader {
    /// Parse only the metadata fields; the payload is skipped, not decoded
    pub fn from_bytes(bytes: &[u8]) -> crate::error::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Legacy Formats
// =============================================================================

/// Pre-envelope formats still readable for backward compatibility.
///
/// Tried in order after the current envelope fails to parse. Removable once
/// no unversioned entries remain on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyFormat {
    /// `{"value": <payload>, "cached_at": "<rfc3339>"}`
    Timestamped,
    /// `{"data": <payload>, "timestamp": <epoch seconds>}`
    EpochStamped,
}

/// Order in which legacy formats are attempted
pub const LEGACY_FORMATS: &[LegacyFormat] = &[LegacyFormat::Timestamped, LegacyFormat::EpochStamped];

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TimestampedEntry {
    value: serde_json::Value,
    cached_at: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct EpochStampedEntry {
    data: serde_json::Value,
    timestamp: f64,
}

impl LegacyFormat {
    pub fn name(&self) -> &'static str {
        match self {
            LegacyFormat::Timestamped => "timestamped",
            LegacyFormat::EpochStamped => "epoch-stamped",
        }
    }

    /// Decode raw bytes in this format as `T`
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Option<CacheEntry<T>> {
        let (payload, cached_at) = match self {
            LegacyFormat::Timestamped => {
                let entry: TimestampedEntry = serde_json::from_slice(bytes).ok()?;
                (entry.value, entry.cached_at)
            }
            LegacyFormat::EpochStamped => {
                let entry: EpochStampedEntry = serde_json::from_slice(bytes).ok()?;
                if !entry.timestamp.is_finite() {
                    return None;
                }
                let secs = entry.timestamp.trunc() as i64;
                let nanos = (entry.timestamp.fract() * 1e9) as u32;
                (entry.data, Utc.timestamp_opt(secs, nanos).single()?)
            }
        };
        let value = serde_json::from_value(payload).ok()?;
        Some(CacheEntry::new(value, cached_at))
    }
}

/// Try every legacy format in order
pub fn decode_legacy<T: DeserializeOwned>(bytes: &[u8]) -> Option<(LegacyFormat, CacheEntry<T>)> {
    LEGACY_FORMATS
        .iter()
        .find_map(|format| format.decode(bytes).map(|entry| (*format, entry)))
}

// =============================================================================
// Tests
// =============================================================================
