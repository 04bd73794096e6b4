//! Configuration for the Access Control Caching Proxy
//!
//! This crate owns everything that happens before the proxy starts serving:
//! - Typed settings for every subsystem (logger, introspector, proxy, redis,
//!   rabbitmq, admin, captcha)
//! - Loading from a YAML file with `ACCP__*` environment overrides
//! - Resolving the route tree into flat, fully merged route parameters
//!
//! # Route tree
//!
//! ```text
//! proxy.routes
//!   api ─────────────── parameters: {dsn, cache.memory.ttl: 60s}
//!    ├── v1 ─────────── parameters: {limits: {token: ...}}
//!    │    └── users     (inherits api + v1, own overrides win)
//!    └── excluded: [health]  -> api/health, bypasses cache
//! ```
//!
//! Each node's effective parameters are its parent's merged with its own,
//! computed once at load time (see [`merger`]).

pub mod loader;
pub mod merger;
pub mod route;
pub mod settings;

pub use loader::{load_config, load_config_from_str};
pub use merger::{RouteParametersPatch, deep_merge};
pub use route::{
    CacheParameters, CaptchaParameters, ExternalCacheParameters, HydrationMode, LimitParameters,
    MemoryCacheParameters, PoolParameters, RefreshParameters, ResolvedRoute, RouteNode,
    RouteParameters, resolve_routes,
};
pub use settings::{
    AdminConfig, AppConfig, CaptchaConfig, IntrospectorConfig, LogFormat, LoggerConfig,
    ProxyConfig, RabbitmqConfig, RedisConfig,
};

/// Error types for configuration operations
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl ConfigError {
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        Self::Parse(e.to_string())
    }
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;
