use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

use super::{SecondaryStore, StoreError, StoreResult, path_segments};

#[derive(Debug, Clone)]
enum Stored {
    Text(String),
    Json(Value),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Stored,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process [`SecondaryStore`].
///
/// Expired keys are dropped lazily on access, mirroring what a client of a
/// real store can observe.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.slots.iter().filter(|s| !s.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining time to live of a key, `None` when absent or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let slot = self.slots.get(key)?;
        if slot.is_expired(now) {
            return None;
        }
        slot.expires_at.map(|at| at.saturating_duration_since(now))
    }

    fn live(&self, key: &str) -> Option<Slot> {
        let now = Instant::now();
        let slot = self.slots.get(key)?.clone();
        if slot.is_expired(now) {
            self.slots.remove_if(key, |_, s| s.is_expired(now));
            return None;
        }
        Some(slot)
    }

    fn counter_value(stored: &Stored) -> StoreResult<i64> {
        let text = match stored {
            Stored::Text(t) => t.as_str(),
            Stored::Json(_) => {
                return Err(StoreError::transport("WRONGTYPE counter holds a JSON document"));
            }
        };
        text.parse()
            .map_err(|_| StoreError::transport("value is not an integer"))
    }

    /// Increment and hand the new value to `finish`, which may rewrite it and
    /// the expiry, all under the entry lock.
    fn increment(
        &self,
        key: &str,
        finish: impl FnOnce(i64, &mut Option<Instant>) -> i64,
    ) -> StoreResult<i64> {
        let now = Instant::now();
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                let current = if slot.is_expired(now) {
                    slot.expires_at = None;
                    0
                } else {
                    Self::counter_value(&slot.value)?
                };
                let next = finish(current + 1, &mut slot.expires_at);
                slot.value = Stored::Text(next.to_string());
                Ok(next)
            }
            Entry::Vacant(vacant) => {
                let mut expires_at = None;
                let next = finish(1, &mut expires_at);
                vacant.insert(Slot {
                    value: Stored::Text(next.to_string()),
                    expires_at,
                });
                Ok(next)
            }
        }
    }
}

fn parse_json(json: &str) -> StoreResult<Value> {
    serde_json::from_str(json).map_err(|e| StoreError::transport(format!("invalid JSON: {e}")))
}

fn lookup<'a>(doc: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    segments.iter().try_fold(doc, |node, segment| node.get(*segment))
}

fn lookup_mut<'a>(doc: &'a mut Value, segments: &[&str]) -> Option<&'a mut Value> {
    segments
        .iter()
        .try_fold(doc, |node, segment| node.get_mut(*segment))
}

#[async_trait]
impl SecondaryStore for MemoryStore {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.slots.insert(
            key.to_string(),
            Slot {
                value: Stored::Text(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<String> {
        match self.live(key).map(|s| s.value) {
            Some(Stored::Text(text)) => Ok(text),
            Some(Stored::Json(doc)) => Ok(doc.to_string()),
            None => Err(StoreError::NotFound),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.slots.remove(key);
        Ok(())
    }

    async fn touch(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let now = Instant::now();
        match self.slots.get_mut(key) {
            Some(mut slot) if !slot.is_expired(now) => {
                slot.expires_at = Some(now + ttl);
                Ok(())
            }
            _ => Err(StoreError::NotFound),
        }
    }

    async fn json_get(&self, key: &str, path: &str) -> StoreResult<String> {
        let segments = path_segments(path)?;
        let doc = match self.live(key).map(|s| s.value) {
            Some(Stored::Json(doc)) => doc,
            Some(Stored::Text(_)) => {
                return Err(StoreError::transport("WRONGTYPE key holds a plain value"));
            }
            None => return Err(StoreError::NotFound),
        };
        lookup(&doc, &segments)
            .map(Value::to_string)
            .ok_or(StoreError::NotFound)
    }

    async fn json_set(&self, key: &str, path: &str, json: &str) -> StoreResult<()> {
        let segments = path_segments(path)?;
        let value = parse_json(json)?;
        let now = Instant::now();

        if segments.is_empty() {
            // Root replacement keeps an existing expiry, like JSON.SET does.
            let expires_at = self
                .slots
                .get(key)
                .filter(|s| !s.is_expired(now))
                .and_then(|s| s.expires_at);
            self.slots.insert(
                key.to_string(),
                Slot {
                    value: Stored::Json(value),
                    expires_at,
                },
            );
            return Ok(());
        }

        let mut slot = match self.slots.get_mut(key) {
            Some(slot) if !slot.is_expired(now) => slot,
            _ => return Err(StoreError::NotFound),
        };
        let Stored::Json(doc) = &mut slot.value else {
            return Err(StoreError::transport("WRONGTYPE key holds a plain value"));
        };
        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| StoreError::transport("empty JSON path"))?;
        match lookup_mut(doc, parents) {
            Some(Value::Object(map)) => {
                map.insert((*last).to_string(), value);
                Ok(())
            }
            _ => Err(StoreError::NotFound),
        }
    }

    async fn json_set_if_absent(&self, key: &str, path: &str, json: &str) -> StoreResult<bool> {
        let segments = path_segments(path)?;
        let exists = match self.live(key).map(|s| s.value) {
            Some(Stored::Json(doc)) => lookup(&doc, &segments).is_some(),
            Some(Stored::Text(_)) => true,
            None => false,
        };
        if exists {
            return Ok(false);
        }
        self.json_set(key, path, json).await?;
        Ok(true)
    }

    async fn json_delete(&self, key: &str, path: &str) -> StoreResult<()> {
        let segments = path_segments(path)?;
        let Some((last, parents)) = segments.split_last() else {
            self.slots.remove(key);
            return Ok(());
        };
        if let Some(mut slot) = self.slots.get_mut(key) {
            if let Stored::Json(doc) = &mut slot.value {
                if let Some(Value::Object(map)) = lookup_mut(doc, parents) {
                    map.remove(*last);
                }
            }
        }
        Ok(())
    }

    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        self.increment(key, |c, expires_at| {
            if c == 1 {
                *expires_at = Some(Instant::now() + ttl);
            }
            c
        })
    }

    async fn increment_with_cap(&self, key: &str, cap: i64) -> StoreResult<i64> {
        self.increment(key, |c, _| if c >= cap { 0 } else { c })
    }

    async fn get_counter(&self, key: &str) -> StoreResult<i64> {
        let slot = self.live(key).ok_or(StoreError::NotFound)?;
        Self::counter_value(&slot.value)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
