//! Error types for the tiered cache

use std::sync::Arc;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the tiered cache
///
/// Only [`Error::TypeMismatch`], [`Error::Offline`] and [`Error::Upstream`]
/// cross the public cache API. Everything else is produced by layers and
/// backends and is recovered locally as a miss.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Public API Errors
    // =========================================================================
    /// Caller's expected type disagrees with the stored or in-flight value
    #[error("Type mismatch for key {key}: expected {expected}, found {found}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    /// No connectivity and no cached value of any age
    #[error("Offline and no cached value available for key {key}")]
    Offline { key: String },

    /// Error raised by the fetch fallback, shared by every coalesced caller
    #[error("{0}")]
    Upstream(Arc<anyhow::Error>),

    // =========================================================================
    // Layer Errors (recovered locally)
    // =========================================================================
    /// Envelope or payload failed to parse
    #[error("Failed to decode cached payload: {0}")]
    Decode(String),

    /// Persisted artifact written under another schema version
    #[error("Schema version mismatch: stored {stored}, current {current}")]
    SchemaVersionMismatch { stored: u32, current: u32 },

    /// Value contains a leaf that cannot be encoded
    #[error("Unencodable value at {path}: {reason}")]
    Unencodable { path: String, reason: String },

    /// Layer does not implement an operation
    #[error("{layer} layer does not support {operation}")]
    Unsupported {
        layer: &'static str,
        operation: &'static str,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // =========================================================================
    // Construction Errors
    // =========================================================================
    /// Key does not follow `domain:kind:discriminator[:version]`
    #[error("Invalid cache key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    /// Pattern is not a valid regular expression
    #[error("Invalid key pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap an upstream fetch error
    pub fn upstream(err: anyhow::Error) -> Self {
        Error::Upstream(Arc::new(err))
    }

    /// The original upstream error, if this is one
    pub fn as_upstream(&self) -> Option<&anyhow::Error> {
        match self {
            Error::Upstream(err) => Some(err.as_ref()),
            _ => None,
        }
    }

    /// Returns true for the offline-without-cache condition
    pub fn is_offline(&self) -> bool {
        matches!(self, Error::Offline { .. })
    }

    /// Returns true for a type mismatch
    pub fn is_type_mismatch(&self) -> bool {
        matches!(self, Error::TypeMismatch { .. })
    }
}
