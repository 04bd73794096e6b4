//! Loading `AppConfig` from YAML with environment overrides

use config::{Config, Environment, File, FileFormat};
use std::path::Path;

use crate::{AppConfig, ConfigError, Result};

/// Default file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "accp.yaml";

/// Load configuration from `path` (or `accp.yaml` when present), apply
/// `ACCP__*` environment overrides and validate the result.
///
/// An explicitly given path must exist.
pub fn load_config(path: Option<&str>) -> Result<AppConfig> {
    let mut builder = Config::builder();
    match path {
        Some(p) => {
            if !Path::new(p).exists() {
                return Err(ConfigError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("config file '{p}' not found"),
                )));
            }
            builder = builder.add_source(File::new(p, FileFormat::Yaml));
        }
        None => {
            if Path::new(DEFAULT_CONFIG_FILE).exists() {
                builder = builder.add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml));
            }
        }
    }
    // Environment variable overrides, e.g., ACCP__REDIS__URL=redis://cache:6379
    builder = builder.add_source(
        Environment::with_prefix("ACCP")
            .try_parsing(true)
            .separator("__"),
    );
    finish(builder.build()?)
}

/// Load configuration from an in-memory YAML document, without env overrides.
pub fn load_config_from_str(yaml: &str) -> Result<AppConfig> {
    let cfg = Config::builder()
        .add_source(File::from_str(yaml, FileFormat::Yaml))
        .build()?;
    finish(cfg)
}

fn finish(cfg: Config) -> Result<AppConfig> {
    let merged: AppConfig = cfg
        .try_deserialize()
        .map_err(|e| ConfigError::parse(format!("config deserialize error: {e}")))?;
    merged.validate()?;
    tracing::debug!(
        routes = merged.proxy.routes.len(),
        redis = merged.redis.enabled,
        rabbitmq = merged.rabbitmq.enabled,
        "configuration loaded"
    );
    Ok(merged)
}
