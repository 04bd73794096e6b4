//! Captcha stage.
//!
//! A request passes when it carries either a proxy-issued captcha token
//! (`Accp-Captcha-Token`, HS256 JWT) or a reCAPTCHA response
//! (`g-recaptcha-response`) that the verification endpoint accepts. After a
//! reCAPTCHA pass the proxy hands out a fresh token so the client can skip
//! the widget until it expires.

use accp_config::CaptchaConfig;
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::record::RequestRecord;

pub const HEADER_CAPTCHA_TOKEN: &str = "accp-captcha-token";
pub const HEADER_CAPTCHA_DISABLE: &str = "accp-captcha-disable";
pub const HEADER_RECAPTCHA_RESPONSE: &str = "g-recaptcha-response";

const TOKEN_SUBJECT: &str = "accp-captcha";

#[derive(Debug, Clone, thiserror::Error)]
pub enum CaptchaError {
    #[error("no captcha token or response")]
    Missing,

    #[error("captcha rejected: {0}")]
    Rejected(String),

    #[error("captcha verification unavailable: {0}")]
    Transport(String),

    #[error("captcha token error: {0}")]
    Token(String),
}

/// How a request satisfied the captcha
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptchaPass {
    /// Valid proxy-issued token
    FromClient,
    /// Verified reCAPTCHA response
    FromGoogle,
}

#[async_trait]
pub trait CaptchaVerifier: Send + Sync {
    async fn verify(&self, response: &str, remote_ip: Option<&str>) -> Result<(), CaptchaError>;
}

/// reCAPTCHA `siteverify` client
#[derive(Debug, Clone)]
pub struct RecaptchaVerifier {
    client: reqwest::Client,
    secret: String,
    verify_url: String,
}

#[derive(Debug, Deserialize)]
struct SiteVerifyResponse {
    success: bool,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}

impl RecaptchaVerifier {
    pub fn new(config: &CaptchaConfig) -> Result<Self, CaptchaError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CaptchaError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            secret: config.secret.clone(),
            verify_url: config.verify_url.clone(),
        })
    }
}

#[async_trait]
impl CaptchaVerifier for RecaptchaVerifier {
    async fn verify(&self, response: &str, remote_ip: Option<&str>) -> Result<(), CaptchaError> {
        // the serializer is not Send; finish it before the first await
        let body = {
            let mut form = url::form_urlencoded::Serializer::new(String::new());
            form.append_pair("secret", &self.secret);
            form.append_pair("response", response);
            if let Some(ip) = remote_ip {
                form.append_pair("remoteip", ip);
            }
            form.finish()
        };

        let reply: SiteVerifyResponse = self
            .client
            .post(&self.verify_url)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(body)
            .send()
            .await
            .map_err(|e| CaptchaError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| CaptchaError::Transport(e.to_string()))?;

        if reply.success {
            Ok(())
        } else {
            Err(CaptchaError::Rejected(reply.error_codes.join(",")))
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CaptchaClaims {
    sub: String,
    iat: i64,
    exp: i64,
}

/// Verifies captcha evidence on a request and issues captcha tokens.
pub struct CaptchaGuard {
    verifier: Arc<dyn CaptchaVerifier>,
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl std::fmt::Debug for CaptchaGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptchaGuard")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl CaptchaGuard {
    pub fn new(verifier: Arc<dyn CaptchaVerifier>, jwt_secret: &str, ttl: Duration) -> Self {
        Self {
            verifier,
            encoding: EncodingKey::from_secret(jwt_secret.as_bytes()),
            decoding: DecodingKey::from_secret(jwt_secret.as_bytes()),
            ttl,
        }
    }

    /// `Ok(None)` when the request carries the route's ignore key.
    pub async fn check(
        &self,
        record: &RequestRecord,
        ignore_key: &str,
    ) -> Result<Option<CaptchaPass>, CaptchaError> {
        if !ignore_key.is_empty() && record.header(HEADER_CAPTCHA_DISABLE) == Some(ignore_key) {
            return Ok(None);
        }

        if let Some(token) = record.header(HEADER_CAPTCHA_TOKEN) {
            match self.validate_token(token) {
                Ok(()) => return Ok(Some(CaptchaPass::FromClient)),
                Err(e) => tracing::debug!(error = %e, "captcha token not accepted"),
            }
        }

        let response = record
            .header(HEADER_RECAPTCHA_RESPONSE)
            .filter(|r| !r.is_empty())
            .ok_or(CaptchaError::Missing)?;
        let remote_ip = record
            .header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim);
        self.verifier.verify(response, remote_ip).await?;
        Ok(Some(CaptchaPass::FromGoogle))
    }

    pub fn issue_token(&self) -> Result<String, CaptchaError> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let claims = CaptchaClaims {
            sub: TOKEN_SUBJECT.to_string(),
            iat: now,
            exp: now + self.ttl.as_secs() as i64,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| CaptchaError::Token(e.to_string()))
    }

    fn validate_token(&self, token: &str) -> Result<(), CaptchaError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp", "sub"]);
        let data = decode::<CaptchaClaims>(token, &self.decoding, &validation)
            .map_err(|e| CaptchaError::Token(e.to_string()))?;
        if data.claims.sub != TOKEN_SUBJECT {
            return Err(CaptchaError::Token("unexpected subject".into()));
        }
        Ok(())
    }
}
