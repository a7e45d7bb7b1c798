//! Schema Versioning
//!
//! One schema version covers every persisted artifact. The version last run
//! against a store is kept as a marker in a flat-store namespace of its own,
//! so clearing the entry stores never clears the marker.

use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use super::storage::FlatStore;
use crate::error::{Error, Result};

/// Schema version written by this build
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

const MARKER_KEY: &str = "cache_schema_version";

/// What the stored marker says about the entry stores
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerState {
    /// Marker matches the current version
    Current,
    /// No marker (fresh install or pre-marker data)
    Missing,
    /// Marker from another version
    Stale(u32),
    /// Marker could not be read or parsed
    Unreadable,
}

impl MarkerState {
    /// Entry stores must be cleared before use
    pub fn requires_clear(&self) -> bool {
        !matches!(self, MarkerState::Current)
    }

    /// The version mismatch a stale marker represents
    pub fn mismatch(&self, current: u32) -> Option<Error> {
        match *self {
            MarkerState::Stale(stored) => Some(Error::SchemaVersionMismatch { stored, current }),
            _ => None,
        }
    }
}

impl fmt::Display for MarkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarkerState::Current => f.write_str("current"),
            MarkerState::Missing => f.write_str("missing"),
            MarkerState::Stale(v) => write!(f, "stale (v{v})"),
            MarkerState::Unreadable => f.write_str("unreadable"),
        }
    }
}

/// Reads and writes the schema marker
pub struct VersionGuard {
    marker: Arc<dyn FlatStore>,
    current: u32,
}

impl VersionGuard {
    pub fn new(marker: Arc<dyn FlatStore>, current: u32) -> Self {
        Self { marker, current }
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    /// Compare the stored marker with the current version
    pub async fn check(&self) -> MarkerState {
        match self.marker.get(MARKER_KEY).await {
            Ok(None) => MarkerState::Missing,
            Ok(Some(raw)) => match raw.trim().parse::<u32>() {
                Ok(v) if v == self.current => MarkerState::Current,
                Ok(v) => MarkerState::Stale(v),
                Err(_) => {
                    warn!(marker = %raw, "Schema marker is not a number");
                    MarkerState::Unreadable
                }
            },
            Err(e) => {
                warn!(error = %e, "Failed to read schema marker");
                MarkerState::Unreadable
            }
        }
    }

    /// Record the current version as the one the stores were cleared for
    pub async fn commit(&self) -> Result<()> {
        self.marker
            .put(MARKER_KEY, self.current.to_string())
            .await?;
        info!(version = self.current, "Schema marker updated");
        Ok(())
    }
}
