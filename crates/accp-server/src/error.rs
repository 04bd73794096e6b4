//! Client-facing proxy errors.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::fmt;

/// Errors that end a request before (or instead of) an upstream response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    /// No route, or the route has no upstream.
    RouteNotFound,

    /// Missing or inactive bearer token (401).
    Unauthorized(String),

    /// Captcha verification failed (403).
    CaptchaRequired,

    /// A limit dimension is exhausted (429).
    LimitReached,

    /// Request body above the configured limit (413).
    PayloadTooLarge,

    /// Upstream, introspection or store failure (503).
    Unavailable(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RouteNotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::CaptchaRequired => StatusCode::FORBIDDEN,
            Self::LimitReached => StatusCode::TOO_MANY_REQUESTS,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Body text sent to the client; internal details stay in the logs.
    fn body(&self) -> &'static str {
        match self {
            Self::RouteNotFound => "route not found",
            Self::Unauthorized(_) => "unauthorized",
            Self::CaptchaRequired => "captcha required",
            Self::LimitReached => "limit reached",
            Self::PayloadTooLarge => "payload too large",
            Self::Unavailable(_) => "service unavailable",
        }
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RouteNotFound => write!(f, "route not found"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {}", msg),
            Self::CaptchaRequired => write!(f, "captcha verification failed"),
            Self::LimitReached => write!(f, "limit reached"),
            Self::PayloadTooLarge => write!(f, "payload too large"),
            Self::Unavailable(msg) => write!(f, "unavailable: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), self.body()).into_response()
    }
}
