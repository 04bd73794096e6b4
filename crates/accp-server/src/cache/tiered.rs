//! Memory tier in front of an optional external tier.

use std::sync::Arc;

use super::{CacheError, ExternalCache, MemoryCache};
use crate::metrics;
use crate::record::CacheEntry;
use crate::route::Fingerprint;

#[derive(Debug, Clone)]
pub struct TwoTierCache {
    memory: Arc<MemoryCache>,
    external: Option<ExternalCache>,
}

impl TwoTierCache {
    pub fn new(memory: Arc<MemoryCache>, external: Option<ExternalCache>) -> Self {
        Self { memory, external }
    }

    pub fn memory(&self) -> &Arc<MemoryCache> {
        &self.memory
    }

    pub fn external(&self) -> Option<&ExternalCache> {
        self.external.as_ref()
    }

    /// Look an entry up, reconciling the memory copy with the external tier.
    ///
    /// A memory hit is served only while its uuid matches the external one;
    /// otherwise the external entry replaces it.
    pub async fn select(&self, key: &Fingerprint) -> Result<Arc<CacheEntry>, CacheError> {
        let local = self.memory.select(key).ok();
        let refresh_expire = local.as_ref().is_some_and(|e| e.status_code() < 400);

        let Some(external) = &self.external else {
            return match local {
                Some(entry) => {
                    metrics::record_cache_hit("memory");
                    Ok(entry)
                }
                None => {
                    metrics::record_cache_miss();
                    Err(CacheError::NotFound)
                }
            };
        };

        if refresh_expire {
            match external.expire(key).await {
                Ok(()) => {}
                Err(CacheError::NotFound) => {
                    self.memory.delete(key);
                    metrics::record_cache_miss();
                    return Err(CacheError::NotFound);
                }
                Err(e) => {
                    tracing::warn!(fingerprint = %key, error = %e, "external expire failed");
                }
            }
        }

        if let Some(entry) = local {
            match external.get_uuid(key).await {
                Ok(uuid) if uuid == entry.response.uuid => {
                    metrics::record_cache_hit("memory");
                    return Ok(entry);
                }
                Ok(_) | Err(CacheError::NotFound) => {}
                Err(e) => {
                    tracing::warn!(fingerprint = %key, error = %e, "external uuid read failed, serving memory copy");
                    metrics::record_cache_hit("memory");
                    return Ok(entry);
                }
            }
        }

        match external.get(key).await {
            Ok(entry) => {
                let entry = Arc::new(entry);
                self.memory.replace(*key, entry.clone());
                metrics::record_cache_hit("external");
                Ok(entry)
            }
            Err(e) => {
                if e.is_not_found() {
                    self.memory.delete(key);
                    metrics::record_cache_miss();
                }
                Err(e)
            }
        }
    }

    /// Store a fresh entry in both tiers; a present memory entry is kept.
    pub async fn add(&self, key: Fingerprint, entry: Arc<CacheEntry>) -> Result<(), CacheError> {
        self.memory.add(key, entry.clone());
        if let Some(external) = &self.external {
            external.add(&key, &entry).await?;
        }
        Ok(())
    }

    /// Overwrite an entry in both tiers.
    pub async fn update(&self, key: Fingerprint, entry: Arc<CacheEntry>) -> Result<(), CacheError> {
        self.memory.replace(key, entry.clone());
        if let Some(external) = &self.external {
            external.update(&key, &entry).await?;
        }
        Ok(())
    }

    pub async fn delete(&self, key: &Fingerprint) -> Result<(), CacheError> {
        self.memory.delete(key);
        if let Some(external) = &self.external {
            external.delete(key).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TtlPolicy;
    use crate::record::{HeaderRecord, ResponseRecord};
    use crate::store::{MemoryStore, SecondaryStore, StoreError, StoreResult};
    use async_trait::async_trait;
    use axum::body::Bytes;
    use std::time::Duration;

    fn policy() -> TtlPolicy {
        TtlPolicy::new(Duration::from_secs(60), Duration::from_secs(5))
    }

    fn entry(status: u16, body: &'static str) -> Arc<CacheEntry> {
        Arc::new(CacheEntry::new(
            None,
            ResponseRecord::new(status, HeaderRecord::new(), Bytes::from_static(body.as_bytes())),
        ))
    }

    fn tiered(store: Arc<dyn SecondaryStore>) -> TwoTierCache {
        TwoTierCache::new(
            Arc::new(MemoryCache::new(policy())),
            Some(ExternalCache::new(store, "t:", policy())),
        )
    }

    #[tokio::test]
    async fn test_memory_only() {
        let cache = TwoTierCache::new(Arc::new(MemoryCache::new(policy())), None);
        let key = Fingerprint(1);
        assert!(cache.select(&key).await.unwrap_err().is_not_found());
        cache.add(key, entry(200, "a")).await.unwrap();
        assert_eq!(&cache.select(&key).await.unwrap().response.body[..], b"a");
        cache.delete(&key).await.unwrap();
        assert!(cache.select(&key).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_hit_with_matching_uuid() {
        let store = Arc::new(MemoryStore::new());
        let cache = tiered(store.clone());
        let key = Fingerprint(2);
        let stored = entry(200, "a");
        cache.add(key, stored.clone()).await.unwrap();
        let got = cache.select(&key).await.unwrap();
        assert!(Arc::ptr_eq(&got, &stored));
    }

    #[tokio::test]
    async fn test_uuid_mismatch_adopts_external() {
        let store = Arc::new(MemoryStore::new());
        let cache = tiered(store.clone());
        let key = Fingerprint(3);
        cache.add(key, entry(200, "old")).await.unwrap();

        // Another instance refreshed the entry.
        let other = tiered(store.clone());
        other.update(key, entry(200, "new")).await.unwrap();

        let got = cache.select(&key).await.unwrap();
        assert_eq!(&got.response.body[..], b"new");
        let again = cache.memory().select(&key).unwrap();
        assert_eq!(again.response.uuid, got.response.uuid);
    }

    #[tokio::test]
    async fn test_external_expired_drops_memory_copy() {
        let store = Arc::new(MemoryStore::new());
        let cache = tiered(store.clone());
        let key = Fingerprint(4);
        cache.add(key, entry(200, "a")).await.unwrap();
        store.json_delete("t:0000000000000004", "$").await.unwrap();

        assert!(cache.select(&key).await.unwrap_err().is_not_found());
        assert!(cache.memory().is_empty());
    }

    #[tokio::test]
    async fn test_external_fill_on_memory_miss() {
        let store = Arc::new(MemoryStore::new());
        let key = Fingerprint(5);
        tiered(store.clone()).add(key, entry(200, "shared")).await.unwrap();

        let cold = tiered(store.clone());
        assert!(cold.memory().is_empty());
        let got = cold.select(&key).await.unwrap();
        assert_eq!(&got.response.body[..], b"shared");
        assert_eq!(cold.memory().len(), 1);
    }

    #[tokio::test]
    async fn test_error_entry_dropped_when_external_gone() {
        let store = Arc::new(MemoryStore::new());
        let cache = tiered(store.clone());
        let key = Fingerprint(6);
        cache.add(key, entry(503, "down")).await.unwrap();
        store.json_delete("t:0000000000000006", "$").await.unwrap();

        assert!(cache.select(&key).await.unwrap_err().is_not_found());
        assert!(cache.memory().is_empty());

        cache.add(key, entry(200, "up")).await.unwrap();
        let got = cache.select(&key).await.unwrap();
        assert_eq!(&got.response.body[..], b"up");
    }

    /// Store whose every call fails at the transport level.
    struct Unreachable;

    #[async_trait]
    impl SecondaryStore for Unreachable {
        async fn put(&self, _: &str, _: &str, _: Duration) -> StoreResult<()> {
            Err(StoreError::transport("down"))
        }
        async fn get(&self, _: &str) -> StoreResult<String> {
            Err(StoreError::transport("down"))
        }
        async fn delete(&self, _: &str) -> StoreResult<()> {
            Err(StoreError::transport("down"))
        }
        async fn touch(&self, _: &str, _: Duration) -> StoreResult<()> {
            Err(StoreError::transport("down"))
        }
        async fn json_get(&self, _: &str, _: &str) -> StoreResult<String> {
            Err(StoreError::transport("down"))
        }
        async fn json_set(&self, _: &str, _: &str, _: &str) -> StoreResult<()> {
            Err(StoreError::transport("down"))
        }
        async fn json_set_if_absent(&self, _: &str, _: &str, _: &str) -> StoreResult<bool> {
            Err(StoreError::transport("down"))
        }
        async fn json_delete(&self, _: &str, _: &str) -> StoreResult<()> {
            Err(StoreError::transport("down"))
        }
        async fn increment_with_ttl(&self, _: &str, _: Duration) -> StoreResult<i64> {
            Err(StoreError::transport("down"))
        }
        async fn increment_with_cap(&self, _: &str, _: i64) -> StoreResult<i64> {
            Err(StoreError::transport("down"))
        }
        async fn get_counter(&self, _: &str) -> StoreResult<i64> {
            Err(StoreError::transport("down"))
        }
        async fn ping(&self) -> StoreResult<()> {
            Err(StoreError::transport("down"))
        }
    }

    #[tokio::test]
    async fn test_transport_errors_degrade_to_memory() {
        let cache = tiered(Arc::new(Unreachable));
        let key = Fingerprint(6);
        assert!(matches!(
            cache.add(key, entry(200, "a")).await,
            Err(CacheError::Transport(_))
        ));
        // Memory tier was written before the external failure.
        let got = cache.select(&key).await.unwrap();
        assert_eq!(&got.response.body[..], b"a");
    }
}
