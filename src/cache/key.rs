//! Cache Key Namespace
//!
//! Keys have the shape `domain:kind:discriminator[:version]`. Callers build
//! them through [`keys`] so that every logical value has exactly one key.
//!
//! # Content-format versions
//!
//! Each [`KeyDomain`] carries a content-format version. Version 1 keys have no
//! version segment; from version 2 on a `v<N>` segment is appended, so a
//! payload shape change in one domain never collides with entries written in
//! the old shape.

use std::fmt;
use std::hash::{Hash, Hasher};

use regex::Regex;

use crate::error::{Error, Result};

/// Cache key - `domain:kind:discriminator[:version]`
#[derive(Clone, Debug, Eq)]
pub struct CacheKey {
    /// Precomputed hash of the full key string
    hash: u64,
    /// Full key string
    raw: String,
    /// Byte offsets of the first two separators
    kind_start: usize,
    discriminator_start: usize,
    /// Parsed `v<N>` suffix, if any
    version: Option<u32>,
    /// End of the discriminator (start of `:v<N>` or end of string)
    discriminator_end: usize,
}

impl CacheKey {
    /// Parse and validate a key string
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let invalid = |reason: &str| Error::InvalidKey {
            key: raw.clone(),
            reason: reason.to_string(),
        };

        let mut parts = raw.splitn(3, ':');
        let domain = parts.next().unwrap_or_default();
        let kind = parts.next().ok_or_else(|| invalid("missing kind segment"))?;
        let rest = parts
            .next()
            .ok_or_else(|| invalid("missing discriminator segment"))?;

        for (name, segment) in [("domain", domain), ("kind", kind)] {
            if segment.is_empty() {
                return Err(invalid(&format!("empty {name} segment")));
            }
            if !segment
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
            {
                return Err(invalid(&format!(
                    "{name} segment must be lowercase ascii"
                )));
            }
        }

        let kind_start = domain.len() + 1;
        let discriminator_start = kind_start + kind.len() + 1;

        // A trailing `:v<N>` is the content-format version
        let (discriminator, version) = match rest.rsplit_once(':') {
            Some((head, tail)) if !head.is_empty() => match parse_version(tail) {
                Some(v) => (head, Some(v)),
                None => (rest, None),
            },
            _ => (rest, None),
        };
        if discriminator.is_empty() {
            return Err(invalid("empty discriminator segment"));
        }

        Ok(Self {
            hash: fx_hash(raw.as_bytes()),
            kind_start,
            discriminator_start,
            discriminator_end: discriminator_start + discriminator.len(),
            version,
            raw,
        })
    }

    /// Build a key from its segments
    fn from_segments(domain: KeyDomain, kind: &str, discriminator: &str) -> Self {
        let version = Some(domain.format_version()).filter(|v| *v >= 2);
        let mut raw = format!("{}:{}:{}", domain.as_str(), kind, discriminator);
        let kind_start = domain.as_str().len() + 1;
        let discriminator_start = kind_start + kind.len() + 1;
        let discriminator_end = raw.len();
        if let Some(v) = version {
            raw.push_str(&format!(":v{v}"));
        }

        Self {
            hash: fx_hash(raw.as_bytes()),
            raw,
            kind_start,
            discriminator_start,
            discriminator_end,
            version,
        }
    }

    /// Full key string
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Domain segment
    #[inline]
    pub fn domain(&self) -> &str {
        &self.raw[..self.kind_start.saturating_sub(1)]
    }

    /// Kind segment
    #[inline]
    pub fn kind(&self) -> &str {
        &self.raw[self.kind_start..self.discriminator_start.saturating_sub(1)]
    }

    /// Discriminator segment (without the version suffix)
    #[inline]
    pub fn discriminator(&self) -> &str {
        &self.raw[self.discriminator_start..self.discriminator_end]
    }

    /// Content-format version, if the key carries one
    #[inline]
    pub fn version(&self) -> Option<u32> {
        self.version
    }

    /// Stable 64-bit fingerprint of the key string
    #[inline]
    pub fn fingerprint(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.raw == other.raw
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for CacheKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn parse_version(segment: &str) -> Option<u32> {
    let digits = segment.strip_prefix('v')?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Fast non-cryptographic hash (FxHash algorithm)
#[inline]
pub(crate) fn fx_hash(bytes: &[u8]) -> u64 {
    const SEED: u64 = 0x517cc1b727220a95;
    let mut hash = SEED;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(SEED);
    }
    hash
}

// =============================================================================
// Domains
// =============================================================================

/// Logical key domains with their content-format versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyDomain {
    /// Activities and activity streams from the training platform
    Strava,
    /// Daily computed scores
    Score,
    /// High-frequency physiological samples
    Samples,
    /// Periodic wellness batches
    Wellness,
    /// Daily aggregates
    Daily,
}

impl KeyDomain {
    /// Domain segment
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyDomain::Strava => "strava",
            KeyDomain::Score => "score",
            KeyDomain::Samples => "samples",
            KeyDomain::Wellness => "wellness",
            KeyDomain::Daily => "daily",
        }
    }

    /// Content-format version of payloads stored under this domain
    pub fn format_version(&self) -> u32 {
        match self {
            KeyDomain::Strava | KeyDomain::Score | KeyDomain::Samples => 1,
            KeyDomain::Wellness => 1,
            KeyDomain::Daily => 2,
        }
    }
}

/// Kinds of daily score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScoreKind {
    Recovery,
    Sleep,
    Strain,
}

impl ScoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreKind::Recovery => "recovery",
            ScoreKind::Sleep => "sleep",
            ScoreKind::Strain => "strain",
        }
    }
}

impl std::str::FromStr for ScoreKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "recovery" => Ok(ScoreKind::Recovery),
            "sleep" => Ok(ScoreKind::Sleep),
            "strain" => Ok(ScoreKind::Strain),
            other => Err(Error::Config(format!("unknown score kind: {other}"))),
        }
    }
}

/// Canonical key constructors, one per logical domain
pub mod keys {
    use chrono::{DateTime, NaiveDate, TimeZone};

    use super::{CacheKey, KeyDomain, ScoreKind};
    use crate::error::{Error, Result};

    /// Activities for the last `days_back` days
    pub fn activities(days_back: u32) -> CacheKey {
        CacheKey::from_segments(KeyDomain::Strava, "activities", &days_back.to_string())
    }

    /// Immutable time-series streams of one activity
    pub fn activity_streams(activity_id: u64) -> CacheKey {
        CacheKey::from_segments(KeyDomain::Strava, "streams", &activity_id.to_string())
    }

    /// Score of a kind for a calendar date
    pub fn score(kind: ScoreKind, date: NaiveDate) -> CacheKey {
        CacheKey::from_segments(KeyDomain::Score, kind.as_str(), &date.to_string())
    }

    /// Score for the day containing `instant`, in the instant's own time zone
    pub fn score_at<Tz: TimeZone>(kind: ScoreKind, instant: &DateTime<Tz>) -> CacheKey {
        score(kind, instant.date_naive())
    }

    /// Physiological samples of one metric for a day.
    ///
    /// The metric becomes the kind segment verbatim, so it must be a
    /// non-empty run of lowercase ascii letters, digits or `_`.
    pub fn samples(metric: &str, date: NaiveDate) -> Result<CacheKey> {
        let valid = !metric.is_empty()
            && metric
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid {
            return Err(Error::InvalidKey {
                key: format!("samples:{metric}:{date}"),
                reason: "metric must be lowercase ascii letters, digits or '_'".to_string(),
            });
        }
        Ok(CacheKey::from_segments(KeyDomain::Samples, metric, &date.to_string()))
    }

    /// Wellness batch covering `start..=end`
    pub fn wellness_batch(start: NaiveDate, end: NaiveDate) -> CacheKey {
        CacheKey::from_segments(KeyDomain::Wellness, "batch", &format!("{start}_{end}"))
    }

    /// Daily aggregate record for a date
    pub fn daily_aggregate(date: NaiveDate) -> CacheKey {
        CacheKey::from_segments(KeyDomain::Daily, "aggregate", &date.to_string())
    }
}

// =============================================================================
// Patterns
// =============================================================================

/// Key pattern for `remove_matching`
///
/// `"*"` matches every key. Anything else is a regular expression anchored at
/// both ends of the full key string.
#[derive(Debug, Clone)]
pub enum KeyPattern {
    /// Every key
    All,
    /// Anchored regular expression
    Regex(Regex),
}

impl KeyPattern {
    /// Compile a pattern
    pub fn new(pattern: &str) -> Result<Self> {
        if pattern == "*" {
            return Ok(KeyPattern::All);
        }
        Regex::new(&format!("^(?:{pattern})$"))
            .map(KeyPattern::Regex)
            .map_err(|source| Error::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })
    }

    /// Pattern matching every key
    pub fn all() -> Self {
        KeyPattern::All
    }

    /// Every key of a domain
    pub fn domain(domain: KeyDomain) -> Result<Self> {
        Self::prefix(&format!("{}:", domain.as_str()))
    }

    /// Every key starting with a literal prefix
    pub fn prefix(prefix: &str) -> Result<Self> {
        Self::new(&format!("{}.*", regex::escape(prefix)))
    }

    /// Test a raw key string
    pub fn matches_str(&self, key: &str) -> bool {
        match self {
            KeyPattern::All => true,
            KeyPattern::Regex(regex) => regex.is_match(key),
        }
    }

    /// Test a key
    pub fn matches(&self, key: &CacheKey) -> bool {
        self.matches_str(key.as_str())
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPattern::All => f.write_str("*"),
            KeyPattern::Regex(regex) => f.write_str(regex.as_str()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use proptest::prelude::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_activities_key() {
        let key = keys::activities(90);
        assert_eq!(key.as_str(), "strava:activities:90");
        assert_eq!(key.domain(), "strava");
        assert_eq!(key.kind(), "activities");
        assert_eq!(key.discriminator(), "90");
        assert_eq!(key.version(), None);
    }

    #[test]
    fn test_score_key() {
        let key = keys::score(ScoreKind::Recovery, date(2025, 1, 1));
        assert_eq!(key.as_str(), "score:recovery:2025-01-01");
    }

    #[test]
    fn test_score_at_normalizes_to_day() {
        let morning = Utc.with_ymd_and_hms(2025, 1, 1, 6, 30, 0).unwrap();
        let evening = Utc.with_ymd_and_hms(2025, 1, 1, 22, 5, 9).unwrap();
        assert_eq!(
            keys::score_at(ScoreKind::Sleep, &morning),
            keys::score_at(ScoreKind::Sleep, &evening)
        );
    }

    #[test]
    fn test_versioned_domain_appends_segment() {
        let key = keys::daily_aggregate(date(2025, 3, 4));
        assert_eq!(key.as_str(), "daily:aggregate:2025-03-04:v2");
        assert_eq!(key.discriminator(), "2025-03-04");
        assert_eq!(key.version(), Some(2));
    }

    #[test]
    fn test_compound_discriminator() {
        let key = keys::wellness_batch(date(2025, 1, 1), date(2025, 1, 7));
        assert_eq!(key.as_str(), "wellness:batch:2025-01-01_2025-01-07");
        assert_eq!(key.discriminator(), "2025-01-01_2025-01-07");
    }

    #[test]
    fn test_samples_key() {
        let key = keys::samples("heart_rate", date(2025, 1, 1)).unwrap();
        assert_eq!(key.as_str(), "samples:heart_rate:2025-01-01");
        assert_eq!(key.kind(), "heart_rate");
    }

    #[test]
    fn test_samples_rejects_unrepresentable_metrics() {
        let day = date(2025, 1, 1);
        for metric in ["", "hr-1", "Heart_Rate", "!!!", "spo2 avg"] {
            assert!(
                matches!(keys::samples(metric, day), Err(Error::InvalidKey { .. })),
                "{metric:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_rejects_malformed_keys() {
        assert!(CacheKey::parse("strava").is_err());
        assert!(CacheKey::parse("strava:activities").is_err());
        assert!(CacheKey::parse("Strava:activities:90").is_err());
        assert!(CacheKey::parse("strava::90").is_err());
        assert!(CacheKey::parse("strava:activities:").is_err());
    }

    #[test]
    fn test_parse_keeps_colons_inside_discriminator() {
        let key = CacheKey::parse("strava:streams:123:watts").unwrap();
        assert_eq!(key.discriminator(), "123:watts");
        assert_eq!(key.version(), None);
    }

    #[test]
    fn test_equal_keys_hash_equal() {
        let a = CacheKey::parse("strava:activities:30").unwrap();
        let b = keys::activities(30);
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_pattern_star_matches_everything() {
        let pattern = KeyPattern::new("*").unwrap();
        assert!(pattern.matches(&keys::activities(7)));
        assert!(pattern.matches(&keys::daily_aggregate(date(2025, 1, 1))));
    }

    #[test]
    fn test_pattern_is_anchored() {
        let pattern = KeyPattern::new("strava:activities:\\d+").unwrap();
        assert!(pattern.matches(&keys::activities(90)));
        assert!(!pattern.matches(&keys::activity_streams(90)));
        assert!(!pattern.matches_str("xstrava:activities:90"));
        assert!(!pattern.matches_str("strava:activities:90:v2"));
    }

    #[test]
    fn test_domain_pattern() {
        let pattern = KeyPattern::domain(KeyDomain::Score).unwrap();
        assert!(pattern.matches(&keys::score(ScoreKind::Strain, date(2025, 2, 2))));
        assert!(!pattern.matches(&keys::activities(1)));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(matches!(
            KeyPattern::new("strava:("),
            Err(Error::InvalidPattern { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_activity_keys_are_unique(a in 0u32..100_000, b in 0u32..100_000) {
            prop_assert_eq!(a == b, keys::activities(a) == keys::activities(b));
        }

        #[test]
        fn prop_distinct_metrics_give_distinct_keys(a in "[a-z0-9_]{1,12}", b in "[a-z0-9_]{1,12}") {
            let day = date(2025, 1, 1);
            let (ka, kb) = (keys::samples(&a, day).unwrap(), keys::samples(&b, day).unwrap());
            prop_assert_eq!(a == b, ka == kb);
            prop_assert_eq!(CacheKey::parse(ka.as_str()).unwrap(), ka);
        }

        #[test]
        fn prop_metrics_outside_the_alphabet_are_rejected(
            head in "[a-z0-9_]{0,6}",
            bad in "[^a-z0-9_]",
            tail in "[a-z0-9_]{0,6}",
        ) {
            let metric = format!("{head}{bad}{tail}");
            prop_assert!(keys::samples(&metric, date(2025, 1, 1)).is_err());
        }

        #[test]
        fn prop_built_keys_parse_back(days in 0u32..10_000) {
            let key = keys::activities(days);
            let parsed = CacheKey::parse(key.as_str()).unwrap();
            prop_assert_eq!(parsed.discriminator(), key.discriminator());
            prop_assert_eq!(parsed, key);
        }
    }
}
