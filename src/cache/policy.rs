//! Cache Policies
//!
//! TTL by key kind and memory eviction limits, declared in one place.

use std::time::Duration;

use serde::Deserialize;

use super::key::CacheKey;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// One TTL rule. `None` segments match anything.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TtlRule {
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    pub ttl_seconds: u64,
}

impl TtlRule {
    pub fn new(domain: Option<&str>, kind: Option<&str>, ttl: Duration) -> Self {
        Self {
            domain: domain.map(str::to_string),
            kind: kind.map(str::to_string),
            ttl_seconds: ttl.as_secs(),
        }
    }

    fn matches(&self, key: &CacheKey) -> bool {
        self.domain.as_deref().map_or(true, |d| d == key.domain())
            && self.kind.as_deref().map_or(true, |k| k == key.kind())
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// TTL policy by key kind; first matching rule wins
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TtlPolicy {
    pub rules: Vec<TtlRule>,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            rules: vec![
                // Activity aggregates
                TtlRule::new(Some("strava"), Some("activities"), Duration::from_secs(HOUR)),
                // Immutable time-series streams
                TtlRule::new(Some("strava"), Some("streams"), Duration::from_secs(7 * DAY)),
                // High-frequency physiological samples
                TtlRule::new(Some("samples"), None, Duration::from_secs(5 * MINUTE)),
                // Daily computed scores
                TtlRule::new(Some("score"), None, Duration::from_secs(48 * HOUR)),
                TtlRule::new(Some("daily"), None, Duration::from_secs(48 * HOUR)),
                // Periodic wellness batches
                TtlRule::new(Some("wellness"), None, Duration::from_secs(10 * MINUTE)),
            ],
        }
    }
}

impl TtlPolicy {
    /// Policy with no rules
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Put a rule in front of the existing ones
    pub fn with_rule(mut self, rule: TtlRule) -> Self {
        self.rules.insert(0, rule);
        self
    }

    /// TTL declared for a key, if any rule matches
    pub fn ttl_for(&self, key: &CacheKey) -> Option<Duration> {
        self.rules.iter().find(|r| r.matches(key)).map(TtlRule::ttl)
    }
}

/// Memory tier eviction limits
///
/// Eviction is by insertion time (`cached_at`), not access time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EvictionPolicy {
    /// Entry count above which eviction runs
    pub max_entries: usize,
    /// Oldest entries removed per eviction pass
    pub eviction_batch_size: usize,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            max_entries: 200,
            eviction_batch_size: 50,
        }
    }
}
