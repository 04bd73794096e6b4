//! Per-process cache tier.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{CacheError, TtlPolicy};
use crate::record::CacheEntry;
use crate::route::Fingerprint;

#[derive(Debug, Clone)]
struct Slot {
    entry: Arc<CacheEntry>,
    last_access: Instant,
}

impl Slot {
    fn new(entry: Arc<CacheEntry>) -> Self {
        Self {
            entry,
            last_access: Instant::now(),
        }
    }

    fn is_expired(&self, policy: &TtlPolicy, now: Instant) -> bool {
        now.saturating_duration_since(self.last_access) > policy.for_status(self.entry.status_code())
    }
}

/// Fingerprint-keyed entries with idle expiry.
///
/// A successful entry's idle clock restarts on every read; error entries
/// expire `ttl_err` after they were stored regardless of reads.
#[derive(Debug)]
pub struct MemoryCache {
    entries: DashMap<Fingerprint, Slot>,
    ttl: TtlPolicy,
}

impl MemoryCache {
    pub fn new(ttl: TtlPolicy) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> TtlPolicy {
        self.ttl
    }

    /// Insert unless an entry already exists. Returns whether it was inserted.
    pub fn add(&self, key: Fingerprint, entry: Arc<CacheEntry>) -> bool {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(&self.ttl, Instant::now()) {
                    occupied.insert(Slot::new(entry));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::new(entry));
                true
            }
        }
    }

    pub fn replace(&self, key: Fingerprint, entry: Arc<CacheEntry>) {
        self.entries.insert(key, Slot::new(entry));
    }

    pub fn select(&self, key: &Fingerprint) -> Result<Arc<CacheEntry>, CacheError> {
        let now = Instant::now();
        {
            let Some(mut slot) = self.entries.get_mut(key) else {
                return Err(CacheError::NotFound);
            };
            if !slot.is_expired(&self.ttl, now) {
                if slot.entry.status_code() < 400 {
                    slot.last_access = now;
                }
                return Ok(slot.entry.clone());
            }
        }
        self.entries
            .remove_if(key, |_, slot| slot.is_expired(&self.ttl, now));
        Err(CacheError::NotFound)
    }

    pub fn delete(&self, key: &Fingerprint) {
        self.entries.remove(key);
    }

    /// Whether a live entry is stored under `key`, without touching it.
    pub fn contains(&self, key: &Fingerprint) -> bool {
        self.entries
            .get(key)
            .is_some_and(|slot| !slot.is_expired(&self.ttl, Instant::now()))
    }

    /// Visit every live entry.
    pub fn range(&self, mut visitor: impl FnMut(&Fingerprint, &Arc<CacheEntry>)) {
        let now = Instant::now();
        for item in self.entries.iter() {
            if !item.is_expired(&self.ttl, now) {
                visitor(item.key(), &item.entry);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries of one status class. Returns how many were removed.
    pub fn sweep(&self, errors: bool) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, slot| {
            let is_error = slot.entry.status_code() >= 400;
            is_error != errors || !slot.is_expired(&self.ttl, now)
        });
        before.saturating_sub(self.entries.len())
    }

    /// Start the success-class and error-class sweepers.
    pub fn spawn_sweepers(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        [(false, self.ttl.ttl), (true, self.ttl.ttl_err)]
            .into_iter()
            .map(|(errors, every)| {
                let cache = Arc::clone(self);
                let cancel = cancel.clone();
                tokio::spawn(async move { cache.sweep_loop(errors, every, cancel).await })
            })
            .collect()
    }

    async fn sweep_loop(&self, errors: bool, every: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(every.max(Duration::from_millis(10)));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let removed = self.sweep(errors);
                    if removed > 0 {
                        tracing::debug!(removed, errors, "swept memory cache");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{HeaderRecord, ResponseRecord};
    use axum::body::Bytes;

    fn entry(status: u16, body: &'static str) -> Arc<CacheEntry> {
        Arc::new(CacheEntry::new(
            None,
            ResponseRecord::new(status, HeaderRecord::new(), Bytes::from_static(body.as_bytes())),
        ))
    }

    fn cache() -> MemoryCache {
        MemoryCache::new(TtlPolicy::new(
            Duration::from_secs(60),
            Duration::from_secs(2),
        ))
    }

    #[tokio::test]
    async fn test_add_is_noop_when_present() {
        let cache = cache();
        let key = Fingerprint(1);
        assert!(cache.add(key, entry(200, "a")));
        assert!(!cache.add(key, entry(200, "b")));
        assert_eq!(&cache.select(&key).unwrap().response.body[..], b"a");

        cache.replace(key, entry(200, "c"));
        assert_eq!(&cache.select(&key).unwrap().response.body[..], b"c");
        assert_eq!(cache.len(), 1);

        cache.delete(&key);
        assert!(cache.select(&key).unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_entries_expire_on_ttl_err() {
        let cache = cache();
        let key = Fingerprint(2);
        cache.add(key, entry(500, "boom"));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.select(&key).unwrap().status_code(), 500);
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(cache.select(&key).unwrap_err().is_not_found());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_entries_slide_on_read() {
        let cache = cache();
        let key = Fingerprint(3);
        cache.add(key, entry(200, "ok"));
        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(40)).await;
            assert!(cache.select(&key).is_ok());
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.select(&key).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_by_class() {
        let cache = cache();
        cache.add(Fingerprint(1), entry(200, "ok"));
        cache.add(Fingerprint(2), entry(404, "missing"));
        tokio::time::advance(Duration::from_secs(3)).await;

        assert_eq!(cache.sweep(false), 0);
        assert_eq!(cache.sweep(true), 1);
        assert_eq!(cache.len(), 1);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(cache.sweep(false), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweepers_stop_on_cancel() {
        let cache = Arc::new(cache());
        cache.add(Fingerprint(9), entry(500, "x"));
        let cancel = CancellationToken::new();
        let handles = cache.spawn_sweepers(cancel.clone());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(cache.is_empty());

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_range_visits_all() {
        let cache = cache();
        cache.add(Fingerprint(1), entry(200, "a"));
        cache.add(Fingerprint(2), entry(200, "b"));
        let mut seen = Vec::new();
        cache.range(|key, _| seen.push(*key));
        seen.sort();
        assert_eq!(seen, vec![Fingerprint(1), Fingerprint(2)]);
    }
}
