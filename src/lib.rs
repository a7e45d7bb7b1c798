//! tiercache - Tiered Cache Orchestration Engine
//!
//! Serves typed values from a layered cache (memory → persistent key-value
//! store → structured record store), coordinates concurrent fetches against a
//! single upstream source, falls back to stale data when the upstream fails,
//! and survives schema changes through explicit versioning.
//!
//! # Architecture
//!
//! ```text
//! caller ──▶ TieredCache ──▶ Memory ──▶ Persistent ──▶ Structured
//!                 │             ▲            ▲
//!                 │             └─ promote ──┘
//!                 ▼
//!         coalesced fetch ──▶ upstream ──▶ fan-out to every tier
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Tiers, orchestrator, keys, codec and storage backends
//! - [`error`] - Error types

pub mod cache;
pub mod error;

// Re-export commonly used types
pub use cache::{keys, CacheConfig, CacheKey, TieredCache};
pub use error::{Error, Result};
