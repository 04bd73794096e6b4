//! Upstream calls through a route's client pool.

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, StatusCode},
    response::Response,
};
use tokio::time::Instant;

use crate::metrics;
use crate::pool::{HttpPool, PoolError};
use crate::record::{
    HEADER_RESPONSE_SOURCE, RecordError, RequestRecord, ResponseRecord, ResponseSource,
    build_request, is_hop_by_hop_header,
};

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("upstream request failed: {0}")]
    Transport(String),
}

/// Replay `record` against `dsn` and buffer the response into a record.
pub async fn fetch(
    pool: &HttpPool,
    route: &str,
    dsn: &str,
    record: &RequestRecord,
    body_limit: usize,
) -> Result<ResponseRecord, UpstreamError> {
    let client = pool.checkout().await?;
    let request = build_request(Some(record), dsn, &client)?;
    let started = Instant::now();
    let response = client
        .execute(request)
        .await
        .map_err(|e| UpstreamError::Transport(e.to_string()))?;
    let record = ResponseRecord::read(response, body_limit).await?;
    metrics::record_upstream_latency(route, started.elapsed());
    Ok(record)
}

/// Forward `record` and stream the upstream response back unbuffered.
pub async fn stream(
    pool: &HttpPool,
    route: &str,
    dsn: &str,
    record: &RequestRecord,
) -> Result<Response, UpstreamError> {
    let client = pool.checkout().await?;
    let request = build_request(Some(record), dsn, &client)?;
    let started = Instant::now();
    let upstream = client
        .execute(request)
        .await
        .map_err(|e| UpstreamError::Transport(e.to_string()))?;
    metrics::record_upstream_latency(route, started.elapsed());

    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::builder().status(status);
    if let Some(headers) = response.headers_mut() {
        for (name, value) in upstream.headers() {
            if is_hop_by_hop_header(name.as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(name, value);
            }
        }
        headers.insert(
            HEADER_RESPONSE_SOURCE,
            HeaderValue::from_static(ResponseSource::Bypass.as_str()),
        );
    }
    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| UpstreamError::Transport(e.to_string()))
}
