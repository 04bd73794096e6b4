//! Prometheus metrics for the proxy.
//!
//! This module provides:
//! - Request counts by route, response source and status
//! - Cache hit/miss rates per tier
//! - Limiter denials, introspection failures, refreshes, publish failures
//! - Upstream latency

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    pub const REQUESTS_TOTAL: &str = "accp_requests_total";
    pub const UPSTREAM_DURATION_SECONDS: &str = "accp_upstream_duration_seconds";

    pub const CACHE_HITS_TOTAL: &str = "accp_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "accp_cache_misses_total";
    pub const CACHE_REFRESHES_TOTAL: &str = "accp_cache_refreshes_total";

    pub const LIMIT_DENIED_TOTAL: &str = "accp_limit_denied_total";
    pub const INTROSPECTION_FAILURES_TOTAL: &str = "accp_introspection_failures_total";
    pub const PUBLISH_FAILURES_TOTAL: &str = "accp_publish_failures_total";
}

/// Initialize the Prometheus metrics exporter.
///
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    // Pull-based: the admin listener serves /metrics itself
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }

            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

/// Record a completed proxy request.
pub fn record_request(route: &str, source: &str, status: u16) {
    counter!(
        names::REQUESTS_TOTAL,
        "route" => route.to_string(),
        "source" => source.to_string(),
        "status_class" => status_class(status)
    )
    .increment(1);
}

pub fn record_upstream_latency(route: &str, duration: Duration) {
    histogram!(names::UPSTREAM_DURATION_SECONDS, "route" => route.to_string())
        .record(duration.as_secs_f64());
}

/// Record a cache hit.
pub fn record_cache_hit(tier: &str) {
    counter!(names::CACHE_HITS_TOTAL, "tier" => tier.to_string()).increment(1);
}

/// Record a cache miss.
pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

/// `trigger` is `counter` or `period`.
pub fn record_refresh(route: &str, trigger: &str) {
    counter!(
        names::CACHE_REFRESHES_TOTAL,
        "route" => route.to_string(),
        "trigger" => trigger.to_string()
    )
    .increment(1);
}

pub fn record_limit_denied(route: &str, dimension: &str) {
    counter!(
        names::LIMIT_DENIED_TOTAL,
        "route" => route.to_string(),
        "dimension" => dimension.to_string()
    )
    .increment(1);
}

pub fn record_introspection_failure(reason: &str) {
    counter!(names::INTROSPECTION_FAILURES_TOTAL, "reason" => reason.to_string()).increment(1);
}

pub fn record_publish_failure() {
    counter!(names::PUBLISH_FAILURES_TOTAL).increment(1);
}

fn status_class(status: u16) -> &'static str {
    match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_class() {
        assert_eq!(status_class(204), "2xx");
        assert_eq!(status_class(429), "4xx");
        assert_eq!(status_class(503), "5xx");
        assert_eq!(status_class(99), "other");
    }

    #[test]
    fn test_recorded_metrics_are_rendered() {
        assert!(init_metrics());
        assert!(!init_metrics());

        record_request("/api", "cache", 200);
        record_cache_hit("memory");
        record_limit_denied("/api", "ip");

        let text = render_metrics().expect("recorder installed");
        assert!(text.contains(names::REQUESTS_TOTAL));
        assert!(text.contains(r#"status_class="2xx""#));
        assert!(text.contains(names::CACHE_HITS_TOTAL));
        assert!(text.contains(names::LIMIT_DENIED_TOTAL));
    }
}
