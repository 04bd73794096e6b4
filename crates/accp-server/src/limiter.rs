//! Per-route rate limiting over named dimensions.
//!
//! Each dimension (`token`, `ip`, ...) extracts a value from the request,
//! hashes it with xxh3 and counts hits per hash in a fixed window. With a
//! secondary store configured the count is shared between instances via
//! `increment_with_ttl`; the local and shared counters are reconciled by
//! taking the larger one.

use accp_config::LimitParameters;
use dashmap::DashMap;
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use xxhash_rust::xxh3::xxh3_64;

use crate::introspect::{cookie_value, strip_scheme};
use crate::record::RequestRecord;
use crate::store::{SecondaryStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum LimitError {
    #[error("limit '{0}' reached")]
    Reached(String),

    #[error("limit store error: {0}")]
    Store(#[from] StoreError),
}

/// Window state of one limited value
#[derive(Debug, Clone, Copy)]
struct LimitState {
    counter: u64,
    window_start: Instant,
    last_access: Instant,
}

impl LimitState {
    fn new(now: Instant) -> Self {
        Self {
            counter: 0,
            window_start: now,
            last_access: now,
        }
    }
}

/// Counters of a single limit dimension
pub struct LimitTable {
    name: String,
    route_key: String,
    params: LimitParameters,
    states: DashMap<u64, LimitState>,
    store: Option<Arc<dyn SecondaryStore>>,
}

impl std::fmt::Debug for LimitTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimitTable")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("states", &self.states.len())
            .finish()
    }
}

impl LimitTable {
    pub fn new(
        name: impl Into<String>,
        route_key: impl Into<String>,
        params: LimitParameters,
        store: Option<Arc<dyn SecondaryStore>>,
    ) -> Self {
        Self {
            name: name.into(),
            route_key: route_key.into(),
            params,
            states: DashMap::new(),
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Value of this dimension: header names in order, then cookie names.
    pub fn extract(&self, record: &RequestRecord) -> Option<String> {
        for name in &self.params.header_names {
            let Some(value) = record.header(name) else {
                continue;
            };
            let value = if name.eq_ignore_ascii_case("authorization") {
                strip_scheme(value).unwrap_or(value)
            } else if name.eq_ignore_ascii_case("x-forwarded-for") {
                value.split(',').next().unwrap_or_default()
            } else {
                value
            };
            let value = value.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
        self.params
            .cookie_names
            .iter()
            .find_map(|name| cookie_value(record, name))
    }

    /// Count one hit for `hash`; returns `true` when the caller is limited.
    pub async fn check(&self, hash: u64) -> Result<bool, LimitError> {
        let now = Instant::now();
        let local = {
            let mut state = self
                .states
                .entry(hash)
                .or_insert_with(|| LimitState::new(now));
            if now.duration_since(state.window_start) >= self.params.ttl {
                state.counter = 0;
                state.window_start = now;
            }
            state.last_access = now;
            if state.counter >= self.params.max_counter {
                return Ok(true);
            }
            state.counter += 1;
            state.counter
        };

        let Some(store) = &self.store else {
            return Ok(false);
        };
        let key = format!("{}_{}_{:016x}", self.route_key, self.name, hash);
        let shared = store.increment_with_ttl(&key, self.params.ttl).await?;
        let shared = u64::try_from(shared).unwrap_or(0);
        let adopted = local.max(shared);
        if adopted > local {
            if let Some(mut state) = self.states.get_mut(&hash) {
                state.counter = state.counter.max(adopted);
            }
        }
        Ok(adopted > self.params.max_counter)
    }

    /// Drop states idle for longer than the window.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.states.len();
        self.states
            .retain(|_, state| now.duration_since(state.last_access) < self.params.ttl);
        before - self.states.len()
    }

    fn ttl(&self) -> Duration {
        self.params.ttl
    }
}

/// All limit dimensions of a route, in declaration order
#[derive(Debug, Default)]
pub struct Limiter {
    tables: Vec<Arc<LimitTable>>,
}

impl Limiter {
    pub fn new(
        route_key: &str,
        limits: &IndexMap<String, LimitParameters>,
        store: Option<Arc<dyn SecondaryStore>>,
    ) -> Self {
        let tables = limits
            .iter()
            .map(|(name, params)| {
                Arc::new(LimitTable::new(
                    name.clone(),
                    route_key,
                    params.clone(),
                    store.clone(),
                ))
            })
            .collect();
        Self { tables }
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn tables(&self) -> &[Arc<LimitTable>] {
        &self.tables
    }

    /// Evaluate every dimension in order; the first exhausted one wins.
    /// Dimensions with no value in the request are skipped.
    pub async fn check(&self, record: &RequestRecord) -> Result<(), LimitError> {
        for table in &self.tables {
            let Some(value) = table.extract(record) else {
                continue;
            };
            if table.check(xxh3_64(value.as_bytes())).await? {
                return Err(LimitError::Reached(table.name.clone()));
            }
        }
        Ok(())
    }

    pub fn spawn_sweepers(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        self.tables
            .iter()
            .map(|table| {
                let table = table.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(table.ttl());
                    ticker.tick().await;
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = ticker.tick() => {
                                let removed = table.sweep();
                                if removed > 0 {
                                    tracing::debug!(dimension = %table.name, removed, "limit states swept");
                                }
                            }
                        }
                    }
                })
            })
            .collect()
    }
}
