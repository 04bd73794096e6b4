//! A configured route and its request pipeline.
//!
//! ```text
//! request ─→ excluded? ──yes──────────────────────────────→ bypass
//!              │ no
//!              ├─→ captcha ─→ introspection ─→ limits
//!              │
//!              ├─→ not cacheable ─────────────────────────→ bypass
//!              └─→ fingerprint ─→ two-tier select ──hit───→ cache
//!                                       │ miss
//!                                       └─→ single-flight ─→ back
//! ```
//!
//! Responses served from the cache may trigger a background refresh of the
//! entry every `refresh.max_count` hits; `refresh.period` refreshes every
//! cached entry of the route on a timer.

mod fingerprint;
mod flight;
mod refresh;
mod upstream;

pub use self::fingerprint::Fingerprint;
pub use self::flight::{Flight, Flights};
pub use self::refresh::{RefreshGuard, Refresher};
pub use self::upstream::UpstreamError;

use accp_config::{ResolvedRoute, RouteParameters};
use axum::{
    body::Body,
    http::{HeaderValue, Request, StatusCode},
    response::Response,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::{ExternalCache, MemoryCache, TtlPolicy, TwoTierCache};
use crate::captcha::{CaptchaGuard, CaptchaPass, HEADER_CAPTCHA_TOKEN};
use crate::error::ProxyError;
use crate::introspect::{HEADER_INTROSPECT_BODY, IntrospectError, Introspector, encode_hydration};
use crate::limiter::{LimitError, Limiter};
use crate::metrics;
use crate::middleware::REQUEST_ID_HEADER;
use crate::pool::{HttpPool, PoolError};
use crate::publisher::{Publisher, RequestEvent, spawn_publish};
use crate::record::{CacheEntry, RecordError, RequestRecord, ResponseSource};
use crate::store::SecondaryStore;

pub const HEADER_CACHE_DISABLE: &str = "accp-cache-disable";

/// Shared services handed to every route at build time
#[derive(Clone)]
pub struct Dependencies {
    pub store: Option<Arc<dyn SecondaryStore>>,
    pub introspector: Option<Arc<Introspector>>,
    pub publisher: Option<Arc<dyn Publisher>>,
    pub captcha: Option<Arc<CaptchaGuard>>,
    pub body_limit: usize,
    /// Stops sweepers and refresh timers
    pub cancel: CancellationToken,
}

impl Dependencies {
    pub fn new(body_limit: usize, cancel: CancellationToken) -> Self {
        Self {
            store: None,
            introspector: None,
            publisher: None,
            captcha: None,
            body_limit,
            cancel,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn SecondaryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_introspector(mut self, introspector: Arc<Introspector>) -> Self {
        self.introspector = Some(introspector);
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_captcha(mut self, captcha: Arc<CaptchaGuard>) -> Self {
        self.captcha = Some(captcha);
        self
    }
}

impl std::fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dependencies")
            .field("store", &self.store.is_some())
            .field("introspector", &self.introspector.is_some())
            .field("publisher", &self.publisher.is_some())
            .field("captcha", &self.captcha.is_some())
            .field("body_limit", &self.body_limit)
            .finish()
    }
}

pub struct Route {
    path: String,
    params: RouteParameters,
    pool: HttpPool,
    cache: Option<TwoTierCache>,
    limiter: Limiter,
    introspector: Option<Arc<Introspector>>,
    publisher: Option<Arc<dyn Publisher>>,
    captcha: Option<Arc<CaptchaGuard>>,
    flights: Flights,
    refresher: Refresher,
    body_limit: usize,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("path", &self.path)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl Route {
    /// Build the route and start its background tasks (cache sweepers, limit
    /// sweepers, periodic refresh), all stopped by `deps.cancel`.
    pub fn new(resolved: &ResolvedRoute, deps: &Dependencies) -> Result<Arc<Self>, PoolError> {
        let params = resolved.parameters.clone();

        let cache = (!params.cache.disabled && !params.excluded).then(|| {
            let memory = &params.cache.memory;
            let external = &params.cache.external;
            TwoTierCache::new(
                Arc::new(MemoryCache::new(TtlPolicy::new(memory.ttl, memory.ttl_err))),
                deps.store.clone().map(|store| {
                    ExternalCache::new(
                        store,
                        resolved.key_prefix(),
                        TtlPolicy::new(external.ttl, external.ttl_err),
                    )
                }),
            )
        });

        let limit_key = if params.route_key.is_empty() {
            resolved.path.as_str()
        } else {
            params.route_key.as_str()
        };
        let limiter = Limiter::new(limit_key, &params.limits, deps.store.clone());

        let route = Arc::new(Self {
            path: resolved.path.clone(),
            pool: HttpPool::new(&params.pool)?,
            cache,
            limiter,
            introspector: deps.introspector.clone(),
            publisher: deps.publisher.clone(),
            captcha: deps.captcha.clone(),
            flights: Flights::new(),
            refresher: Refresher::new(),
            body_limit: deps.body_limit,
            params,
        });
        route.start(deps.cancel.clone());
        Ok(route)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn parameters(&self) -> &RouteParameters {
        &self.params
    }

    pub fn cache(&self) -> Option<&TwoTierCache> {
        self.cache.as_ref()
    }

    pub fn refresher(&self) -> &Refresher {
        &self.refresher
    }

    pub fn flights(&self) -> &Flights {
        &self.flights
    }

    fn start(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut tasks = self.limiter.spawn_sweepers(cancel.clone());
        if let Some(cache) = &self.cache {
            tasks.extend(cache.memory().spawn_sweepers(cancel.clone()));
        }
        tasks.extend(self.spawn_counter_prune(cancel.clone()));
        tasks.extend(self.spawn_period_refresh(cancel));
        tasks
    }

    /// Run the pipeline for one request.
    pub async fn handle(self: &Arc<Self>, req: Request<Body>) -> Response {
        let request_id = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string();

        match self.pipeline(req).await {
            Ok((response, source)) => {
                let status = response.status();
                if !status.is_success() {
                    tracing::info!(
                        request_id = %request_id,
                        route = %self.path,
                        status = status.as_u16(),
                        source = %source,
                        "non-success response"
                    );
                }
                metrics::record_request(&self.path, source.as_str(), status.as_u16());
                response
            }
            Err(err) => self.reject(&request_id, err),
        }
    }

    async fn pipeline(
        self: &Arc<Self>,
        req: Request<Body>,
    ) -> Result<(Response, ResponseSource), ProxyError> {
        if self.params.dsn.is_empty() {
            return Err(ProxyError::RouteNotFound);
        }

        let (mut record, _) = RequestRecord::read(req, self.body_limit)
            .await
            .map_err(|e| match e {
                RecordError::BodyTooLarge { .. } => ProxyError::PayloadTooLarge,
                other => ProxyError::Unavailable(other.to_string()),
            })?;
        // Only the proxy sets this header
        record.remove_header(HEADER_INTROSPECT_BODY);

        if self.params.excluded {
            return Ok((self.bypass(record).await?, ResponseSource::Bypass));
        }

        let captcha = self.check_captcha(&record).await?;
        let hydration = self.hydrate(&mut record).await?;
        self.check_limits(&record).await?;

        let (mut response, source) = match &self.cache {
            Some(cache) if self.is_cacheable(&record) => self.cached(cache, record).await?,
            _ => (self.bypass(record).await?, ResponseSource::Bypass),
        };

        let headers = response.headers_mut();
        if let Some(value) = hydration.and_then(|v| HeaderValue::try_from(v).ok()) {
            headers.insert(HEADER_INTROSPECT_BODY, value);
        }
        if captcha == Some(CaptchaPass::FromGoogle) && response.status() == StatusCode::OK {
            if let Some(guard) = &self.captcha {
                match guard.issue_token().map(HeaderValue::try_from) {
                    Ok(Ok(token)) => {
                        response.headers_mut().insert(HEADER_CAPTCHA_TOKEN, token);
                    }
                    Ok(Err(e)) => tracing::warn!(error = %e, "captcha token not a header value"),
                    Err(e) => tracing::warn!(error = %e, "failed to issue captcha token"),
                }
            }
        }
        Ok((response, source))
    }

    fn is_cacheable(&self, record: &RequestRecord) -> bool {
        let disabled = record
            .header(HEADER_CACHE_DISABLE)
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));
        !disabled && self.params.allows_method(&record.method)
    }

    async fn check_captcha(&self, record: &RequestRecord) -> Result<Option<CaptchaPass>, ProxyError> {
        if !self.params.captcha.enabled {
            return Ok(None);
        }
        let Some(guard) = &self.captcha else {
            return Ok(None);
        };
        guard
            .check(record, &self.params.captcha.ignore_key)
            .await
            .map_err(|e| {
                tracing::debug!(route = %self.path, error = %e, "captcha check failed");
                ProxyError::CaptchaRequired
            })
    }

    /// Introspect the caller's token and attach the encoded reply to the
    /// upstream request. Returns the header value that was attached.
    async fn hydrate(&self, record: &mut RequestRecord) -> Result<Option<String>, ProxyError> {
        if !self.params.introspect {
            return Ok(None);
        }
        let Some(introspector) = &self.introspector else {
            return Err(ProxyError::Unavailable("introspector not configured".into()));
        };
        match introspector.hydrate(record).await {
            Ok(body) => {
                let value = encode_hydration(self.params.introspect_hydration, &body);
                if let Some(value) = &value {
                    record.set_header(HEADER_INTROSPECT_BODY, value.clone());
                }
                Ok(value)
            }
            Err(e @ (IntrospectError::BadAuthRequest | IntrospectError::TokenInactive(_))) => {
                Err(ProxyError::Unauthorized(e.to_string()))
            }
            Err(e) => Err(ProxyError::Unavailable(e.to_string())),
        }
    }

    async fn check_limits(&self, record: &RequestRecord) -> Result<(), ProxyError> {
        match self.limiter.check(record).await {
            Ok(()) => Ok(()),
            Err(LimitError::Reached(dimension)) => {
                metrics::record_limit_denied(&self.path, &dimension);
                Err(ProxyError::LimitReached)
            }
            Err(LimitError::Store(e)) => Err(ProxyError::Unavailable(e.to_string())),
        }
    }

    /// Forward without caching and stream the response back.
    async fn bypass(&self, record: RequestRecord) -> Result<Response, ProxyError> {
        let response = upstream::stream(&self.pool, &self.path, &self.params.dsn, &record)
            .await
            .map_err(|e| ProxyError::Unavailable(e.to_string()))?;
        self.publish(
            &record,
            response.status().as_u16(),
            Uuid::new_v4(),
            time::OffsetDateTime::now_utc().unix_timestamp(),
            ResponseSource::Bypass,
        );
        Ok(response)
    }

    async fn cached(
        self: &Arc<Self>,
        cache: &TwoTierCache,
        record: RequestRecord,
    ) -> Result<(Response, ResponseSource), ProxyError> {
        let key = Fingerprint::of(&record);
        match cache.select(&key).await {
            Ok(entry) => {
                let response = self.serve_cached(cache, key, entry, record).await;
                return Ok((response, ResponseSource::Cache));
            }
            Err(e) if !e.is_not_found() => {
                tracing::warn!(route = %self.path, fingerprint = %key, error = %e, "cache read failed");
            }
            Err(_) => {}
        }
        self.single_flight(cache, key, record).await
    }

    async fn single_flight(
        self: &Arc<Self>,
        cache: &TwoTierCache,
        key: Fingerprint,
        record: RequestRecord,
    ) -> Result<(Response, ResponseSource), ProxyError> {
        match self.flights.join(key) {
            Flight::Leader(done) => {
                let landing = Landing {
                    route: self.clone(),
                    key,
                    done: Some(done),
                };
                // Another flight may have landed between select and join.
                if let Ok(entry) = cache.select(&key).await {
                    drop(landing);
                    let response = self.serve_cached(cache, key, entry, record).await;
                    return Ok((response, ResponseSource::Cache));
                }

                // Spawned so that a disconnecting client does not abort the fetch.
                let route = self.clone();
                let fetched = tokio::spawn(async move {
                    let _landing = landing;
                    route.fetch_and_store(key, record).await
                })
                .await;

                match fetched {
                    Ok(Ok(entry)) => {
                        if let Some(request) = &entry.request {
                            self.publish(
                                request,
                                entry.response.status_code,
                                entry.response.uuid,
                                entry.response.timestamp_unix,
                                ResponseSource::Back,
                            );
                        }
                        Ok((entry.response.to_response(ResponseSource::Back), ResponseSource::Back))
                    }
                    Ok(Err(e)) => Err(ProxyError::Unavailable(e.to_string())),
                    Err(e) => Err(ProxyError::Unavailable(format!("upstream task failed: {e}"))),
                }
            }
            Flight::Follower(landed) => {
                let bound = self.pool.timeout() * 2;
                if !Flights::wait(landed, bound).await {
                    tracing::warn!(route = %self.path, fingerprint = %key, "single-flight wait timed out");
                }
                match cache.select(&key).await {
                    Ok(entry) => {
                        let response = self.serve_cached(cache, key, entry, record).await;
                        Ok((response, ResponseSource::Cache))
                    }
                    Err(e) => Err(ProxyError::Unavailable(format!(
                        "no cache entry after single-flight: {e}"
                    ))),
                }
            }
        }
    }

    async fn fetch_and_store(
        &self,
        key: Fingerprint,
        record: RequestRecord,
    ) -> Result<Arc<CacheEntry>, UpstreamError> {
        let response = upstream::fetch(
            &self.pool,
            &self.path,
            &self.params.dsn,
            &record,
            self.body_limit,
        )
        .await?;
        let entry = Arc::new(CacheEntry::new(Some(record), response));
        if let Some(cache) = &self.cache {
            self.refresher.reset(&key);
            if let Err(e) = cache.add(key, entry.clone()).await {
                tracing::warn!(route = %self.path, fingerprint = %key, error = %e, "cache add failed");
            }
        }
        Ok(entry)
    }

    /// Answer from a cache entry: write it, backfill a missing request
    /// record, publish, and count the hit towards a refresh.
    async fn serve_cached(
        self: &Arc<Self>,
        cache: &TwoTierCache,
        key: Fingerprint,
        entry: Arc<CacheEntry>,
        record: RequestRecord,
    ) -> Response {
        let response = entry.response.to_response(ResponseSource::Cache);
        if entry.request.is_none() {
            cache.memory().replace(
                key,
                Arc::new(CacheEntry::new(Some(record.clone()), entry.response.clone())),
            );
        }
        self.publish(
            &record,
            entry.response.status_code,
            entry.response.uuid,
            entry.response.timestamp_unix,
            ResponseSource::Cache,
        );
        self.count_hit(cache, key).await;
        response
    }

    async fn count_hit(self: &Arc<Self>, cache: &TwoTierCache, key: Fingerprint) {
        let max = self.params.refresh.max_count;
        if max == 0 {
            return;
        }
        let due = match cache.external() {
            Some(external) => match external.refresh_tick(&key, max).await {
                Ok(tick) => tick == 0,
                Err(e) => {
                    tracing::debug!(fingerprint = %key, error = %e, "shared refresh counter unavailable");
                    self.refresher.tick(key, max) == 0
                }
            },
            None => self.refresher.tick(key, max) == 0,
        };
        if due {
            let route = self.clone();
            tokio::spawn(async move { route.refresh_entry(key, "counter").await });
        }
    }

    /// Replay the recorded request of `key` and overwrite the entry in both
    /// tiers; an upstream failure evicts it instead.
    pub async fn refresh_entry(self: Arc<Self>, key: Fingerprint, trigger: &'static str) {
        let Some(cache) = &self.cache else {
            return;
        };
        let Some(_guard) = self.refresher.begin(key) else {
            tracing::debug!(fingerprint = %key, "refresh already running");
            return;
        };

        let current = match cache.memory().select(&key) {
            Ok(entry) => Some(entry),
            Err(_) => match cache.external() {
                Some(external) => external.get(&key).await.ok().map(Arc::new),
                None => None,
            },
        };
        let Some(request) = current.and_then(|entry| entry.request.clone()) else {
            tracing::debug!(fingerprint = %key, error = %RecordError::EmptyRequest, "refresh skipped");
            return;
        };

        match upstream::fetch(&self.pool, &self.path, &self.params.dsn, &request, self.body_limit)
            .await
        {
            Ok(response) => {
                let entry = Arc::new(CacheEntry::new(Some(request), response));
                self.refresher.reset(&key);
                if let Err(e) = cache.update(key, entry).await {
                    tracing::warn!(fingerprint = %key, error = %e, "refreshed entry not stored");
                }
                metrics::record_refresh(&self.path, trigger);
                tracing::debug!(route = %self.path, fingerprint = %key, trigger, "entry refreshed");
            }
            Err(e) => {
                tracing::warn!(route = %self.path, fingerprint = %key, error = %e, "refresh failed, evicting entry");
                self.refresher.reset(&key);
                if let Err(e) = cache.delete(&key).await {
                    tracing::warn!(fingerprint = %key, error = %e, "evict after failed refresh");
                }
            }
        }
    }

    /// Drop local hit counters whose memory entry is gone, once per `ttl_err`.
    fn spawn_counter_prune(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let cache = self.cache.as_ref()?;
        if self.params.refresh.max_count == 0 {
            return None;
        }
        let every = cache.memory().ttl().ttl_err.max(Duration::from_millis(10));
        let route = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Some(cache) = &route.cache {
                            let memory = cache.memory();
                            let pruned = route.refresher.prune(|key| memory.contains(key));
                            if pruned > 0 {
                                tracing::debug!(route = %route.path, pruned, "pruned refresh counters");
                            }
                        }
                    }
                }
            }
        }))
    }

    fn spawn_period_refresh(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let period = self.params.refresh.period;
        if period.is_zero() || self.cache.is_none() {
            return None;
        }
        let route = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let mut keys = Vec::new();
                        if let Some(cache) = &route.cache {
                            cache.memory().range(|key, _| keys.push(*key));
                        }
                        for key in keys {
                            route.clone().refresh_entry(key, "period").await;
                        }
                    }
                }
            }
        }))
    }

    fn publish(
        &self,
        request: &RequestRecord,
        status_code: u16,
        uuid: Uuid,
        timestamp_unix: i64,
        source: ResponseSource,
    ) {
        if self.params.route_key.is_empty() {
            return;
        }
        let Some(publisher) = &self.publisher else {
            return;
        };
        spawn_publish(
            publisher.clone(),
            RequestEvent {
                route: self.path.clone(),
                routing_key: self.params.route_key.clone(),
                request: request.clone(),
                status_code,
                source,
                uuid,
                timestamp_unix,
            },
        );
    }

    fn reject(&self, request_id: &str, err: ProxyError) -> Response {
        let status = err.status();
        if status.is_server_error() {
            tracing::warn!(request_id, route = %self.path, status = status.as_u16(), error = %err, "request failed");
        } else {
            tracing::info!(request_id, route = %self.path, status = status.as_u16(), error = %err, "request rejected");
        }
        metrics::record_request(&self.path, "proxy", status.as_u16());
        axum::response::IntoResponse::into_response(err)
    }
}

/// Lands the flight when the leader's fetch ends, even if it panicked.
struct Landing {
    route: Arc<Route>,
    key: Fingerprint,
    done: Option<watch::Sender<bool>>,
}

impl Drop for Landing {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            self.route.flights.land(&self.key, done);
        }
    }
}
