//! Shared cache tier on top of the secondary store.

use std::sync::Arc;
use uuid::Uuid;

use super::{CacheError, TtlPolicy};
use crate::record::CacheEntry;
use crate::route::Fingerprint;
use crate::store::{ROOT_PATH, SecondaryStore};

const UUID_PATH: &str = "$.response.uuid";

/// Entries stored as JSON documents under `{prefix}{fingerprint}`.
///
/// The shared hit counter of an entry lives under `{prefix}refresh:{fingerprint}`
/// and shares the entry's expiry; storing an entry restarts it at 0.
#[derive(Clone)]
pub struct ExternalCache {
    store: Arc<dyn SecondaryStore>,
    prefix: String,
    ttl: TtlPolicy,
}

impl std::fmt::Debug for ExternalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalCache")
            .field("prefix", &self.prefix)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl ExternalCache {
    pub fn new(store: Arc<dyn SecondaryStore>, prefix: impl Into<String>, ttl: TtlPolicy) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            ttl,
        }
    }

    pub fn key(&self, fingerprint: &Fingerprint) -> String {
        format!("{}{}", self.prefix, fingerprint)
    }

    pub fn refresh_key(&self, fingerprint: &Fingerprint) -> String {
        format!("{}refresh:{}", self.prefix, fingerprint)
    }

    pub fn ttl(&self) -> TtlPolicy {
        self.ttl
    }

    pub async fn add(&self, fingerprint: &Fingerprint, entry: &CacheEntry) -> Result<(), CacheError> {
        let key = self.key(fingerprint);
        let json = serde_json::to_string(entry)?;
        self.store.json_set(&key, ROOT_PATH, &json).await?;
        let ttl = self.ttl.for_status(entry.status_code());
        self.store.touch(&key, ttl).await?;
        self.store
            .put(&self.refresh_key(fingerprint), "0", ttl)
            .await?;
        Ok(())
    }

    pub async fn update(
        &self,
        fingerprint: &Fingerprint,
        entry: &CacheEntry,
    ) -> Result<(), CacheError> {
        self.add(fingerprint, entry).await
    }

    pub async fn get(&self, fingerprint: &Fingerprint) -> Result<CacheEntry, CacheError> {
        let json = self.store.json_get(&self.key(fingerprint), ROOT_PATH).await?;
        Ok(serde_json::from_str(&json)?)
    }

    pub async fn delete(&self, fingerprint: &Fingerprint) -> Result<(), CacheError> {
        self.store
            .json_delete(&self.key(fingerprint), ROOT_PATH)
            .await?;
        self.store.delete(&self.refresh_key(fingerprint)).await?;
        Ok(())
    }

    /// Restart the success TTL of an entry; `NotFound` once it expired.
    pub async fn expire(&self, fingerprint: &Fingerprint) -> Result<(), CacheError> {
        self.store
            .touch(&self.key(fingerprint), self.ttl.ttl)
            .await?;
        match self
            .store
            .touch(&self.refresh_key(fingerprint), self.ttl.ttl)
            .await
        {
            Err(e) if !e.is_not_found() => Err(e.into()),
            _ => Ok(()),
        }
    }

    pub async fn get_uuid(&self, fingerprint: &Fingerprint) -> Result<Uuid, CacheError> {
        let json = self
            .store
            .json_get(&self.key(fingerprint), UUID_PATH)
            .await?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Shared hit counter, wrapping to 0 every `cap` ticks.
    pub async fn refresh_tick(&self, fingerprint: &Fingerprint, cap: u64) -> Result<i64, CacheError> {
        let cap = i64::try_from(cap).unwrap_or(i64::MAX);
        Ok(self
            .store
            .increment_with_cap(&self.refresh_key(fingerprint), cap)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{HeaderRecord, ResponseRecord};
    use crate::store::MemoryStore;
    use axum::body::Bytes;
    use std::time::Duration;

    fn setup() -> (Arc<MemoryStore>, ExternalCache) {
        let store = Arc::new(MemoryStore::new());
        let cache = ExternalCache::new(
            store.clone(),
            "accp:/users:",
            TtlPolicy::new(Duration::from_secs(300), Duration::from_secs(5)),
        );
        (store, cache)
    }

    fn entry(status: u16) -> CacheEntry {
        CacheEntry::new(
            None,
            ResponseRecord::new(status, HeaderRecord::new(), Bytes::from_static(b"body")),
        )
    }

    #[tokio::test]
    async fn test_add_get_uuid() {
        let (store, cache) = setup();
        let fp = Fingerprint(0xfeed);
        let stored = entry(200);
        cache.add(&fp, &stored).await.unwrap();

        assert_eq!(cache.key(&fp), "accp:/users:000000000000feed");
        assert!(store.ttl(&cache.key(&fp)).unwrap() > Duration::from_secs(200));
        assert_eq!(cache.get(&fp).await.unwrap(), stored);
        assert_eq!(cache.get_uuid(&fp).await.unwrap(), stored.response.uuid);
    }

    #[tokio::test]
    async fn test_error_status_uses_ttl_err() {
        let (store, cache) = setup();
        let fp = Fingerprint(7);
        cache.add(&fp, &entry(502)).await.unwrap();
        assert!(store.ttl(&cache.key(&fp)).unwrap() <= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_expire_and_delete() {
        let (_store, cache) = setup();
        let fp = Fingerprint(8);
        assert!(cache.expire(&fp).await.unwrap_err().is_not_found());
        cache.add(&fp, &entry(200)).await.unwrap();
        cache.expire(&fp).await.unwrap();
        cache.delete(&fp).await.unwrap();
        assert!(cache.get(&fp).await.unwrap_err().is_not_found());
        assert!(cache.get_uuid(&fp).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_refresh_tick_wraps() {
        let (_store, cache) = setup();
        let fp = Fingerprint(9);
        let mut ticks = Vec::new();
        for _ in 0..4 {
            ticks.push(cache.refresh_tick(&fp, 2).await.unwrap());
        }
        assert_eq!(ticks, vec![1, 0, 1, 0]);
    }

    #[tokio::test]
    async fn test_stored_entry_restarts_counter_with_its_ttl() {
        let (store, cache) = setup();
        let fp = Fingerprint(10);
        cache.add(&fp, &entry(200)).await.unwrap();
        assert_eq!(cache.refresh_tick(&fp, 3).await.unwrap(), 1);
        assert_eq!(cache.refresh_tick(&fp, 3).await.unwrap(), 2);

        cache.update(&fp, &entry(200)).await.unwrap();
        assert_eq!(cache.refresh_tick(&fp, 3).await.unwrap(), 1);
        let counter_ttl = store.ttl(&cache.refresh_key(&fp)).unwrap();
        assert!(counter_ttl > Duration::from_secs(200));
        assert!(counter_ttl <= Duration::from_secs(300));

        cache.delete(&fp).await.unwrap();
        assert!(store.get(&cache.refresh_key(&fp)).await.unwrap_err().is_not_found());
        assert!(store.is_empty());
    }
}
