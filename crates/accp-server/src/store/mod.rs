//! Shared secondary store.
//!
//! The store backs the external cache tier (JSON documents addressed by a
//! JSONPath), the shared refresh counters and the cross-instance limiter
//! counters. Two bindings exist:
//!
//! - [`RedisStore`]: Redis with the RedisJSON module, through a bounded
//!   `deadpool-redis` pool
//! - [`MemoryStore`]: in-process, same semantics, for single-node runs and tests
//!
//! Every operation is bounded by a timeout; an elapsed timeout is reported as
//! [`StoreError::Transport`].

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use std::time::Duration;

/// JSONPath addressing the whole document
pub const ROOT_PATH: &str = "$";

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,

    #[error("store transport error: {0}")]
    Transport(String),
}

impl StoreError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait SecondaryStore: Send + Sync {
    /// SET with expiry
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<String>;

    /// Remove a key of any type; a missing key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Reset the expiry of an existing key
    async fn touch(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    /// First match of `path` as JSON text
    async fn json_get(&self, key: &str, path: &str) -> StoreResult<String>;

    async fn json_set(&self, key: &str, path: &str, json: &str) -> StoreResult<()>;

    /// Returns `false` when the path already existed
    async fn json_set_if_absent(&self, key: &str, path: &str, json: &str) -> StoreResult<bool>;

    async fn json_delete(&self, key: &str, path: &str) -> StoreResult<()>;

    /// Atomic increment; the expiry is set when the counter is created.
    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> StoreResult<i64>;

    /// Atomic increment that wraps to 0 once the counter reaches `cap`,
    /// keeping the key's expiry.
    async fn increment_with_cap(&self, key: &str, cap: i64) -> StoreResult<i64>;

    async fn get_counter(&self, key: &str) -> StoreResult<i64>;

    async fn ping(&self) -> StoreResult<()>;
}

/// Split `$.a.b` into `["a", "b"]`; `$` yields an empty list.
pub(crate) fn path_segments(path: &str) -> StoreResult<Vec<&str>> {
    let rest = path
        .strip_prefix('$')
        .ok_or_else(|| StoreError::transport(format!("unsupported JSON path '{path}'")))?;
    if rest.is_empty() {
        return Ok(Vec::new());
    }
    let rest = rest
        .strip_prefix('.')
        .ok_or_else(|| StoreError::transport(format!("unsupported JSON path '{path}'")))?;
    Ok(rest.split('.').collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_segments() {
        assert!(path_segments("$").unwrap().is_empty());
        assert_eq!(path_segments("$.response.uuid").unwrap(), vec!["response", "uuid"]);
        assert!(path_segments("response").is_err());
        assert!(path_segments("$response").is_err());
    }
}
