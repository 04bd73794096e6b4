//! Bearer token introspection.
//!
//! The token is looked up in the configured query parameters, then the
//! configured cookies, then the `Authorization` header. It is sent to the
//! authorization server using a templated body; the token is active when the
//! reply contains the configured marker (by default `"active":true`, as in an
//! RFC 7662 response).
//!
//! # Security Considerations
//!
//! - Tokens are never logged; errors carry a masked form (`abcd****wxyz`)
//! - Fields listed in `trim_fields` are removed before the reply is forwarded
//!   upstream in `Accp-Introspect-Body`
//!
//! # References
//!
//! - [RFC 7662 - OAuth 2.0 Token Introspection](https://tools.ietf.org/html/rfc7662)

use accp_config::{HydrationMode, IntrospectorConfig};
use axum::http::{Method, header};
use base64::{Engine, engine::general_purpose::STANDARD};
use cookie::Cookie;
use regex::Regex;

use crate::metrics;
use crate::pool::{HttpPool, PoolError};
use crate::record::{RequestRecord, read_body};

/// Introspection replies are read up to this size
const MAX_BODY: usize = 1024 * 1024;

const TOKEN_PLACEHOLDER: &str = "{{.Token}}";

pub const HEADER_INTROSPECT_BODY: &str = "accp-introspect-body";

#[derive(Debug, thiserror::Error)]
pub enum IntrospectError {
    #[error("no bearer token in request")]
    BadAuthRequest,

    #[error("token {0} is not active")]
    TokenInactive(String),

    #[error("introspection transport error: {0}")]
    Transport(String),
}

impl From<PoolError> for IntrospectError {
    fn from(e: PoolError) -> Self {
        Self::Transport(e.to_string())
    }
}

#[derive(Debug)]
pub struct Introspector {
    pool: HttpPool,
    url: String,
    method: Method,
    content_type: String,
    body_template: String,
    marker: String,
    query_params: Vec<String>,
    cookies: Vec<String>,
    trim: Option<Regex>,
}

impl Introspector {
    pub fn new(config: &IntrospectorConfig) -> anyhow::Result<Self> {
        let method = Method::from_bytes(config.method.to_ascii_uppercase().as_bytes())?;
        let url = format!(
            "{}{}",
            config.dsn.trim_end_matches('/'),
            config.endpoint
        );
        Ok(Self {
            pool: HttpPool::new(&config.pool)?,
            url,
            method,
            content_type: config.content_type.clone(),
            body_template: config.body_template.clone(),
            marker: config.marker.clone(),
            query_params: config.query_params.clone(),
            cookies: config.cookies.clone(),
            trim: trim_regex(&config.trim_fields)?,
        })
    }

    /// Find the caller's token: query parameters, cookies, then `Authorization`.
    pub fn extract_token(&self, record: &RequestRecord) -> Result<String, IntrospectError> {
        if let Some(query) = record.query() {
            for name in &self.query_params {
                let found = url::form_urlencoded::parse(query.as_bytes())
                    .find(|(k, v)| k == name && !v.is_empty())
                    .map(|(_, v)| v.into_owned());
                if let Some(token) = found {
                    return Ok(token);
                }
            }
        }

        for name in &self.cookies {
            if let Some(token) = cookie_value(record, name) {
                return Ok(token);
            }
        }

        record
            .header(header::AUTHORIZATION.as_str())
            .and_then(strip_scheme)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .ok_or(IntrospectError::BadAuthRequest)
    }

    /// Ask the authorization server about `token`; returns the trimmed reply.
    pub async fn introspect(&self, token: &str) -> Result<String, IntrospectError> {
        let client = self.pool.checkout().await?;
        let body = self.body_template.replace(TOKEN_PLACEHOLDER, token);

        let mut response = client
            .request(self.method.clone(), &self.url)
            .header(header::CONTENT_TYPE, &self.content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                metrics::record_introspection_failure("transport");
                IntrospectError::Transport(e.to_string())
            })?;
        let reply = read_body(&mut response, MAX_BODY)
            .await
            .map_err(|e| IntrospectError::Transport(e.to_string()))?;
        let reply = String::from_utf8_lossy(&reply);

        if !reply.contains(&self.marker) {
            metrics::record_introspection_failure("inactive");
            return Err(IntrospectError::TokenInactive(mask_token(token)));
        }
        Ok(self.trim(&reply))
    }

    /// Extract and introspect in one step.
    pub async fn hydrate(&self, record: &RequestRecord) -> Result<String, IntrospectError> {
        let token = self.extract_token(record).inspect_err(|_| {
            metrics::record_introspection_failure("missing_token");
        })?;
        self.introspect(&token).await
    }

    pub fn trim(&self, body: &str) -> String {
        match &self.trim {
            Some(re) => normalize_trailing_comma(&re.replace_all(body, "")),
            None => body.to_string(),
        }
    }
}

/// Encode an introspection reply for the `Accp-Introspect-Body` header.
pub fn encode_hydration(mode: HydrationMode, body: &str) -> Option<String> {
    match mode {
        HydrationMode::None => None,
        HydrationMode::Plaintext => Some(
            body.chars()
                .filter(|c| *c != '\n' && *c != '\r')
                .collect::<String>()
                .replace('"', "\\\""),
        ),
        HydrationMode::Base64 => Some(STANDARD.encode(body.as_bytes())),
    }
}

/// `abcd****wxyz`; short tokens are fully masked.
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}****{tail}")
}

/// Strip a `Bearer`/`Token` scheme (any case) from an Authorization value.
pub fn strip_scheme(value: &str) -> Option<&str> {
    let value = value.trim();
    let (scheme, rest) = value.split_once(char::is_whitespace)?;
    if scheme.eq_ignore_ascii_case("bearer") || scheme.eq_ignore_ascii_case("token") {
        Some(rest.trim())
    } else {
        None
    }
}

pub(crate) fn cookie_value(record: &RequestRecord, name: &str) -> Option<String> {
    record
        .headers
        .get(header::COOKIE.as_str())?
        .iter()
        .flat_map(|h| Cookie::split_parse(h.as_str()))
        .filter_map(Result::ok)
        .find(|c| c.name() == name && !c.value().is_empty())
        .map(|c| c.value().to_string())
}

fn trim_regex(fields: &[String]) -> Result<Option<Regex>, regex::Error> {
    if fields.is_empty() {
        return Ok(None);
    }
    let names = fields
        .iter()
        .map(|f| regex::escape(f))
        .collect::<Vec<_>>()
        .join("|");
    let value = r#""(?:[^"\\]|\\.)*"|\[[^\]]*\]|\{[^}]*\}|[^,}\s]+"#;
    Regex::new(&format!(r#""(?:{names})"\s*:\s*(?:{value})\s*,?\s*"#)).map(Some)
}

fn normalize_trailing_comma(body: &str) -> String {
    static TRAILING: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = TRAILING.get_or_init(|| Regex::new(r",\s*}").expect("static regex"));
    re.replace_all(body, "}").into_owned()
}
