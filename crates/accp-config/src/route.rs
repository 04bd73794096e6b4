//! Route tree nodes and the effective parameters of a single route

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::merger::RouteParametersPatch;
use crate::{ConfigError, Result};

/// One node of `proxy.routes`. The map key is the node's path segment(s).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteNode {
    #[serde(default)]
    pub parameters: RouteParametersPatch,
    #[serde(default)]
    pub routes: IndexMap<String, RouteNode>,
    /// Child segments served as pass-through routes (no cache, no limits)
    #[serde(default)]
    pub excluded: Vec<String>,
}

/// How the introspection body is attached to the upstream request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HydrationMode {
    #[default]
    None,
    Plaintext,
    Base64,
}

/// Effective, fully merged parameters of a route
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RouteParameters {
    /// Upstream base URL; empty means the route answers 404
    pub dsn: String,
    /// Methods eligible for caching
    pub methods: Vec<String>,
    pub introspect: bool,
    pub introspect_hydration: HydrationMode,
    pub cache: CacheParameters,
    pub refresh: RefreshParameters,
    pub pool: PoolParameters,
    /// Limit dimensions, evaluated in declaration order
    pub limits: IndexMap<String, LimitParameters>,
    /// Routing key for request events; empty disables publishing
    pub route_key: String,
    pub captcha: CaptchaParameters,
    pub excluded: bool,
}

impl Default for RouteParameters {
    fn default() -> Self {
        Self {
            dsn: String::new(),
            methods: vec!["GET".to_string()],
            introspect: false,
            introspect_hydration: HydrationMode::None,
            cache: CacheParameters::default(),
            refresh: RefreshParameters::default(),
            pool: PoolParameters::default(),
            limits: IndexMap::new(),
            route_key: String::new(),
            captcha: CaptchaParameters::default(),
            excluded: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct CacheParameters {
    pub disabled: bool,
    pub memory: MemoryCacheParameters,
    pub external: ExternalCacheParameters,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MemoryCacheParameters {
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// TTL for responses with status >= 400
    #[serde(with = "humantime_serde")]
    pub ttl_err: Duration,
}

impl Default for MemoryCacheParameters {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            ttl_err: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExternalCacheParameters {
    /// Defaults to `accp:{route path}:` when empty
    pub key_prefix: String,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub ttl_err: Duration,
}

impl Default for ExternalCacheParameters {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            ttl: Duration::from_secs(300),
            ttl_err: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RefreshParameters {
    /// Refresh an entry on every `max_count`-th cache hit; 0 disables
    pub max_count: u64,
    /// Refresh every cached entry of the route periodically; 0 disables
    #[serde(with = "humantime_serde")]
    pub period: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolParameters {
    /// Maximum concurrent requests through the pool
    pub size: usize,
    /// Per-request timeout, also bounds waiting for a pool slot
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for PoolParameters {
    fn default() -> Self {
        Self {
            size: 64,
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimitParameters {
    pub header_names: Vec<String>,
    pub cookie_names: Vec<String>,
    pub max_counter: u64,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for LimitParameters {
    fn default() -> Self {
        Self {
            header_names: Vec::new(),
            cookie_names: Vec::new(),
            max_counter: 100,
            ttl: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct CaptchaParameters {
    pub enabled: bool,
    /// Value of `Accp-Captcha-Disable` that skips verification
    pub ignore_key: String,
}

impl RouteParameters {
    fn from_value(path: &str, value: Value) -> Result<Self> {
        let mut params: RouteParameters = serde_json::from_value(value)
            .map_err(|e| ConfigError::parse(format!("route '{path}': {e}")))?;
        let mut methods: Vec<String> = Vec::with_capacity(params.methods.len());
        for method in params.methods.drain(..) {
            let method = method.to_ascii_uppercase();
            if !methods.contains(&method) {
                methods.push(method);
            }
        }
        params.methods = methods;
        Ok(params)
    }

    pub fn allows_method(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }

    pub fn validate(&self, path: &str) -> Result<()> {
        if !self.dsn.is_empty() {
            let url = url::Url::parse(&self.dsn).map_err(|e| {
                ConfigError::validation(format!("route '{path}': invalid dsn '{}': {e}", self.dsn))
            })?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(ConfigError::validation(format!(
                    "route '{path}': dsn scheme must be http or https"
                )));
            }
        }
        if self.pool.size == 0 || self.pool.timeout.is_zero() {
            return Err(ConfigError::validation(format!(
                "route '{path}': pool.size and pool.timeout must be > 0"
            )));
        }
        if !self.cache.disabled
            && (self.cache.memory.ttl.is_zero() || self.cache.memory.ttl_err.is_zero())
        {
            return Err(ConfigError::validation(format!(
                "route '{path}': cache.memory ttl and ttl_err must be > 0"
            )));
        }
        for (name, limit) in &self.limits {
            if limit.max_counter == 0 || limit.ttl.is_zero() {
                return Err(ConfigError::validation(format!(
                    "route '{path}': limit '{name}' needs max_counter and ttl > 0"
                )));
            }
            if limit.header_names.is_empty() && limit.cookie_names.is_empty() {
                return Err(ConfigError::validation(format!(
                    "route '{path}': limit '{name}' has no header_names or cookie_names"
                )));
            }
        }
        Ok(())
    }
}

/// A route path with its effective parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRoute {
    pub path: String,
    pub parameters: RouteParameters,
}

impl ResolvedRoute {
    pub fn key_prefix(&self) -> String {
        if self.parameters.cache.external.key_prefix.is_empty() {
            format!("accp:{}:", self.path)
        } else {
            self.parameters.cache.external.key_prefix.clone()
        }
    }
}

/// Flatten the route tree, merging each node's parameters over its parent's.
pub fn resolve_routes(routes: &IndexMap<String, RouteNode>) -> Result<Vec<ResolvedRoute>> {
    let base = serde_json::to_value(RouteParameters::default())
        .map_err(|e| ConfigError::parse(e.to_string()))?;
    let mut out = Vec::new();
    for (segment, node) in routes {
        walk(&join_path("", segment), &base, node, false, &mut out)?;
    }
    Ok(out)
}

fn walk(
    path: &str,
    parent: &Value,
    node: &RouteNode,
    excluded: bool,
    out: &mut Vec<ResolvedRoute>,
) -> Result<()> {
    let mut effective = parent.clone();
    node.parameters.merge_into(&mut effective);
    if excluded {
        mark_excluded(&mut effective);
    }
    out.push(ResolvedRoute {
        path: path.to_string(),
        parameters: RouteParameters::from_value(path, effective.clone())?,
    });

    let is_excluded = |segment: &str| {
        node.excluded
            .iter()
            .any(|e| e.trim_matches('/') == segment.trim_matches('/'))
    };

    for (segment, child) in &node.routes {
        walk(
            &join_path(path, segment),
            &effective,
            child,
            excluded || is_excluded(segment),
            out,
        )?;
    }

    for name in &node.excluded {
        let declared = node
            .routes
            .keys()
            .any(|k| k.trim_matches('/') == name.trim_matches('/'));
        if declared {
            continue;
        }
        let child_path = join_path(path, name);
        let mut params = effective.clone();
        mark_excluded(&mut params);
        out.push(ResolvedRoute {
            parameters: RouteParameters::from_value(&child_path, params)?,
            path: child_path,
        });
    }
    Ok(())
}

fn mark_excluded(value: &mut Value) {
    if let Value::Object(map) = value {
        map.insert("excluded".to_string(), Value::Bool(true));
    }
}

fn join_path(prefix: &str, segment: &str) -> String {
    let segment = segment.trim_matches('/');
    match (prefix.trim_end_matches('/'), segment.is_empty()) {
        ("", true) => "/".to_string(),
        ("", false) => format!("/{segment}"),
        (p, true) => p.to_string(),
        (p, false) => format!("{p}/{segment}"),
    }
}
