//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The admin key is loaded from TOKEN_ROUTER_ADMIN_KEY or admin_key_file,
//! never stored in the TOML directly.

use common::{RegionCode, Secret};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use token_pool::{PoolConfig, SelectionStrategy};
use upstream::UpstreamEndpoints;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub pool: PoolSection,
    pub upstream: UpstreamConfig,
}

/// Admin HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(skip)]
    pub admin_key: Option<Secret<String>>,
    /// Path to a file containing the admin key (alternative to TOKEN_ROUTER_ADMIN_KEY)
    #[serde(default)]
    pub admin_key_file: Option<PathBuf>,
}

/// `[pool]` table. Every field can be overridden from the environment.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub enabled: bool,
    pub file_path: PathBuf,
    /// `<= 0` turns the background health check off.
    pub health_check_interval_ms: i64,
    pub fetch_credit_on_check: bool,
    pub claim_credit_when_empty: bool,
    pub auto_disable: bool,
    pub auto_disable_failures: u32,
    pub strategy: SelectionStrategy,
}

impl Default for PoolSection {
    fn default() -> Self {
        let defaults = PoolConfig::default();
        Self {
            enabled: defaults.enabled,
            file_path: defaults.file_path,
            health_check_interval_ms: token_pool::config::DEFAULT_HEALTH_CHECK_INTERVAL
                .as_millis() as i64,
            fetch_credit_on_check: defaults.fetch_credit_on_check,
            claim_credit_when_empty: defaults.claim_credit_when_empty,
            auto_disable: defaults.auto_disable,
            auto_disable_failures: defaults.auto_disable_failures,
            strategy: defaults.strategy,
        }
    }
}

/// Upstream API settings
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    /// Region code → base URL. Keys are validated on load.
    pub base_urls: HashMap<String, String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub endpoints: EndpointOverrides,
}

/// Optional endpoint path overrides
#[derive(Debug, Default, Deserialize)]
pub struct EndpointOverrides {
    pub liveness_path: Option<String>,
    pub credit_path: Option<String>,
    pub receive_credit_path: Option<String>,
    pub capabilities_path: Option<String>,
}

fn default_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    1000
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Admin key resolution order:
    /// 1. TOKEN_ROUTER_ADMIN_KEY env var
    /// 2. admin_key_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        for (region, url) in &config.upstream.base_urls {
            if RegionCode::parse(region).is_none() {
                return Err(common::Error::Config(format!(
                    "unknown region {region:?} in upstream.base_urls (expected cn, us, hk, jp or sg)"
                )));
            }
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "upstream.base_urls.{region} must start with http:// or https://, got: {url}"
                )));
            }
        }

        if config.upstream.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        config.pool.apply_env()?;

        // Resolve admin key: env var takes precedence over file
        if let Ok(key) = std::env::var("TOKEN_ROUTER_ADMIN_KEY") {
            config.server.admin_key = Some(Secret::new(key));
        } else if let Some(ref key_file) = config.server.admin_key_file {
            let key = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read admin_key_file {}: {e}",
                    key_file.display()
                ))
            })?;
            let key = key.trim().to_owned();
            if !key.is_empty() {
                config.server.admin_key = Some(Secret::new(key));
            }
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("token-router.toml")
    }

    pub fn pool_config(&self) -> PoolConfig {
        let pool = &self.pool;
        PoolConfig {
            enabled: pool.enabled,
            file_path: pool.file_path.clone(),
            health_check_interval: PoolConfig::interval_from_millis(pool.health_check_interval_ms),
            fetch_credit_on_check: pool.fetch_credit_on_check,
            claim_credit_when_empty: pool.claim_credit_when_empty,
            auto_disable: pool.auto_disable,
            auto_disable_failures: pool.auto_disable_failures.max(1),
            strategy: pool.strategy,
        }
    }

    /// Base URLs keyed by region. Keys were validated in `load`.
    pub fn base_urls(&self) -> HashMap<RegionCode, String> {
        self.upstream
            .base_urls
            .iter()
            .filter_map(|(region, url)| {
                RegionCode::parse(region).map(|r| (r, url.trim_end_matches('/').to_string()))
            })
            .collect()
    }

    pub fn endpoints(&self) -> UpstreamEndpoints {
        let overrides = &self.upstream.endpoints;
        let defaults = UpstreamEndpoints::default();
        UpstreamEndpoints {
            liveness_path: overrides
                .liveness_path
                .clone()
                .unwrap_or(defaults.liveness_path),
            credit_path: overrides.credit_path.clone().unwrap_or(defaults.credit_path),
            receive_credit_path: overrides
                .receive_credit_path
                .clone()
                .unwrap_or(defaults.receive_credit_path),
            capabilities_path: overrides
                .capabilities_path
                .clone()
                .unwrap_or(defaults.capabilities_path),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.timeout_secs)
    }
}

impl PoolSection {
    fn apply_env(&mut self) -> common::Result<()> {
        if let Some(v) = env_var("TOKEN_POOL_ENABLED") {
            self.enabled = parse_bool("TOKEN_POOL_ENABLED", &v)?;
        }
        if let Some(v) = env_var("TOKEN_POOL_FILE") {
            self.file_path = PathBuf::from(v);
        }
        if let Some(v) = env_var("TOKEN_POOL_HEALTH_CHECK_INTERVAL_MS") {
            self.health_check_interval_ms = parse_number("TOKEN_POOL_HEALTH_CHECK_INTERVAL_MS", &v)?;
        }
        if let Some(v) = env_var("TOKEN_POOL_FETCH_CREDIT_ON_CHECK") {
            self.fetch_credit_on_check = parse_bool("TOKEN_POOL_FETCH_CREDIT_ON_CHECK", &v)?;
        }
        if let Some(v) = env_var("TOKEN_POOL_CLAIM_CREDIT_WHEN_EMPTY") {
            self.claim_credit_when_empty = parse_bool("TOKEN_POOL_CLAIM_CREDIT_WHEN_EMPTY", &v)?;
        }
        if let Some(v) = env_var("TOKEN_POOL_AUTO_DISABLE") {
            self.auto_disable = parse_bool("TOKEN_POOL_AUTO_DISABLE", &v)?;
        }
        if let Some(v) = env_var("TOKEN_POOL_AUTO_DISABLE_FAILURES") {
            self.auto_disable_failures = parse_number("TOKEN_POOL_AUTO_DISABLE_FAILURES", &v)?;
        }
        if let Some(v) = env_var("TOKEN_POOL_STRATEGY") {
            self.strategy = v
                .parse()
                .map_err(|e| common::Error::Config(format!("TOKEN_POOL_STRATEGY: {e}")))?;
        }
        Ok(())
    }
}

/// Non-blank env var value, trimmed.
fn env_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_bool(key: &str, value: &str) -> common::Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(common::Error::Config(format!(
            "{key} must be a boolean, got: {value}"
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> common::Result<T> {
    value
        .parse()
        .map_err(|_| common::Error::Config(format!("{key} must be an integer, got: {value}")))
}
