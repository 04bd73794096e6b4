//! Request and response records.
//!
//! Records are what the caches store and what the publisher ships: plain data
//! with the body fully buffered so a request can be replayed for refresh and
//! a response can be written any number of times.

use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode},
    response::Response,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub const HEADER_RESPONSE_SOURCE: &str = "accp-response-source";
pub const HEADER_REFRESHED: &str = "accp-refreshed";
pub const HEADER_RESPONSE_UUID: &str = "accp-response-uuid";

/// Header multimap as stored in records
pub type HeaderRecord = BTreeMap<String, Vec<String>>;

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("no request record to replay")]
    EmptyRequest,

    #[error("body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("failed to read body: {0}")]
    Body(String),

    #[error("invalid upstream request: {0}")]
    Build(String),
}

/// Where a response came from, reported in `Accp-Response-Source`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseSource {
    Cache,
    Back,
    Bypass,
}

impl ResponseSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Back => "back",
            Self::Bypass => "bypass",
        }
    }
}

impl fmt::Display for ResponseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Origin-form target: path and query
    pub url: String,
    pub method: String,
    #[serde(with = "base64_bytes")]
    pub body: Bytes,
    pub headers: HeaderRecord,
}

impl RequestRecord {
    /// Buffer the request body (at most `limit` bytes) and return the record
    /// together with an equivalent request whose body can still be consumed.
    pub async fn read(
        req: Request<Body>,
        limit: usize,
    ) -> Result<(RequestRecord, Request<Body>), RecordError> {
        let (parts, body) = req.into_parts();
        let body = axum::body::to_bytes(body, limit)
            .await
            .map_err(|e| read_error(e, limit))?;

        let url = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let record = RequestRecord {
            url,
            method: parts.method.as_str().to_string(),
            body: body.clone(),
            headers: header_record(&parts.headers),
        };
        Ok((record, Request::from_parts(parts, Body::from(body))))
    }

    /// Path component of `url`
    pub fn path(&self) -> &str {
        self.url.split_once('?').map_or(self.url.as_str(), |(p, _)| p)
    }

    /// Query component of `url`, without the `?`
    pub fn query(&self) -> Option<&str> {
        self.url.split_once('?').map(|(_, q)| q)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers
            .insert(name.to_ascii_lowercase(), vec![value.into()]);
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.remove(&name.to_ascii_lowercase());
    }

    pub fn upstream_url(&self, dsn: &str) -> String {
        format!("{}{}", dsn.trim_end_matches('/'), self.url)
    }
}

/// Rebuild an upstream request from a record: same method, target, headers
/// and body, with scheme and authority taken from `dsn`.
pub fn build_request(
    record: Option<&RequestRecord>,
    dsn: &str,
    client: &reqwest::Client,
) -> Result<reqwest::Request, RecordError> {
    let record = record.ok_or(RecordError::EmptyRequest)?;
    let method = Method::from_bytes(record.method.as_bytes())
        .map_err(|e| RecordError::Build(e.to_string()))?;

    let mut headers = HeaderMap::new();
    for (name, values) in &record.headers {
        if is_hop_by_hop_header(name) || name == "content-length" {
            continue;
        }
        let Ok(name) = HeaderName::try_from(name.as_str()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::try_from(value.as_str()) {
                headers.append(name.clone(), value);
            }
        }
    }

    client
        .request(method, record.upstream_url(dsn))
        .headers(headers)
        .body(record.body.clone())
        .build()
        .map_err(|e| RecordError::Build(e.to_string()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    #[serde(with = "base64_bytes")]
    pub body: Bytes,
    pub headers: HeaderRecord,
    pub status_code: u16,
    /// Fetch time, UTC epoch seconds
    pub timestamp_unix: i64,
    /// Regenerated on every upstream fetch; versions the entry across instances
    pub uuid: Uuid,
}

impl ResponseRecord {
    pub fn new(status_code: u16, headers: HeaderRecord, body: Bytes) -> Self {
        Self {
            body,
            headers,
            status_code,
            timestamp_unix: time::OffsetDateTime::now_utc().unix_timestamp(),
            uuid: Uuid::new_v4(),
        }
    }

    /// Drain an upstream response (at most `limit` bytes).
    pub async fn read(mut resp: reqwest::Response, limit: usize) -> Result<Self, RecordError> {
        let status = resp.status().as_u16();
        let headers = header_record(resp.headers());
        let body = read_body(&mut resp, limit).await?;
        Ok(Self::new(status, headers, body))
    }

    pub fn is_error(&self) -> bool {
        self.status_code >= 400
    }

    /// Write the record as a client response tagged with `source`.
    pub fn to_response(&self, source: ResponseSource) -> Response {
        let mut response = Response::new(Body::from(self.body.clone()));
        *response.status_mut() =
            StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::BAD_GATEWAY);

        let headers = response.headers_mut();
        for (name, values) in &self.headers {
            if is_hop_by_hop_header(name) || name == "content-length" {
                continue;
            }
            let Ok(name) = HeaderName::try_from(name.as_str()) else {
                continue;
            };
            for value in values {
                if let Ok(value) = HeaderValue::try_from(value.as_str()) {
                    headers.append(name.clone(), value);
                }
            }
        }
        headers.insert(HEADER_REFRESHED, HeaderValue::from(self.timestamp_unix));
        headers.insert(
            HEADER_RESPONSE_SOURCE,
            HeaderValue::from_static(source.as_str()),
        );
        if let Ok(uuid) = HeaderValue::try_from(self.uuid.to_string()) {
            headers.insert(HEADER_RESPONSE_UUID, uuid);
        }
        response
    }
}

/// A cached request/response pair, keyed by the request fingerprint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub request: Option<RequestRecord>,
    pub response: ResponseRecord,
}

impl CacheEntry {
    pub fn new(request: Option<RequestRecord>, response: ResponseRecord) -> Self {
        Self { request, response }
    }

    pub fn status_code(&self) -> u16 {
        self.response.status_code
    }
}

/// Drain a client response body, failing once it exceeds `limit` bytes.
pub async fn read_body(resp: &mut reqwest::Response, limit: usize) -> Result<Bytes, RecordError> {
    if resp.content_length().is_some_and(|len| len > limit as u64) {
        return Err(RecordError::BodyTooLarge { limit });
    }
    let mut body = Vec::new();
    while let Some(chunk) = resp
        .chunk()
        .await
        .map_err(|e| RecordError::Body(e.to_string()))?
    {
        if body.len() + chunk.len() > limit {
            return Err(RecordError::BodyTooLarge { limit });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(body))
}

/// Copy a header map into a record, lower-cased names, repeated values kept.
pub fn header_record(headers: &HeaderMap) -> HeaderRecord {
    let mut record = HeaderRecord::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        record
            .entry(name.as_str().to_string())
            .or_default()
            .push(value);
    }
    record
}

/// Checks if a header is a hop-by-hop header that should not be forwarded.
///
/// Hop-by-hop headers are defined in RFC 2616 Section 13.5.1.
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "host" // Host should be set to target, not forwarded
    )
}

fn read_error(e: axum::Error, limit: usize) -> RecordError {
    let msg = e.to_string();
    if msg.contains("length limit") {
        RecordError::BodyTooLarge { limit }
    } else {
        RecordError::Body(msg)
    }
}

mod base64_bytes {
    use axum::body::Bytes;
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
