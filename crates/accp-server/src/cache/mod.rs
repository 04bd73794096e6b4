//! Two-tier response cache.
//!
//! ## Architecture
//!
//! - **Memory tier (DashMap)**: per-process, keyed by request fingerprint
//! - **External tier (secondary store)**: JSON documents shared across instances
//!
//! ## Cache Hierarchy
//!
//! ```text
//! request → memory ──hit──→ uuid == external uuid? ──yes──→ memory value
//!              │                     │ no
//!              └──miss──→ external ──┴──hit──→ copy into memory
//!                             │
//!                             └──miss──→ upstream (single-flight)
//! ```
//!
//! Entries with status >= 400 live for `ttl_err` in both tiers, others for
//! `ttl`. Without an external tier the memory tier answers alone.

pub mod external;
pub mod memory;
pub mod tiered;

pub use external::ExternalCache;
pub use memory::MemoryCache;
pub use tiered::TwoTierCache;

use std::time::Duration;

use crate::store::StoreError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("cache entry not found")]
    NotFound,

    #[error("cache transport error: {0}")]
    Transport(String),

    #[error("cache codec error: {0}")]
    Codec(String),
}

impl CacheError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

impl From<StoreError> for CacheError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => Self::NotFound,
            StoreError::Transport(msg) => Self::Transport(msg),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

/// Success / error TTL split of one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub ttl: Duration,
    pub ttl_err: Duration,
}

impl TtlPolicy {
    pub fn new(ttl: Duration, ttl_err: Duration) -> Self {
        Self { ttl, ttl_err }
    }

    pub fn for_status(&self, status: u16) -> Duration {
        if status >= 400 { self.ttl_err } else { self.ttl }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_for_status() {
        let policy = TtlPolicy::new(Duration::from_secs(60), Duration::from_secs(2));
        assert_eq!(policy.for_status(200), Duration::from_secs(60));
        assert_eq!(policy.for_status(399), Duration::from_secs(60));
        assert_eq!(policy.for_status(400), Duration::from_secs(2));
        assert_eq!(policy.for_status(503), Duration::from_secs(2));
    }
}
