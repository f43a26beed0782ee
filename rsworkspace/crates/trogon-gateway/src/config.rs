use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_PATH_VAR: &str = "CONFIG_PATH";
pub const PORT_VAR: &str = "GATEWAY_PORT";

const DEFAULT_CONFIG_PATH: &str = "config.json";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_CAPACITY: i64 = 10;
const DEFAULT_REFILL_INTERVAL_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unmarshal config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Gateway configuration.
///
/// Loaded from the JSON file named by `CONFIG_PATH` (default `config.json`):
///
/// ```json
/// {
///   "service":    { "secret_key": "…", "users": ["alice"], "blacklist": [] },
///   "openai":     { "target_url": "https://api.openai.com/v1/chat/completions", "api_key": "sk-…" },
///   "rate_limit": { "capacity": 10, "refill_interval_second": 60 }
/// }
/// ```
///
/// The listening port is not part of the file; it comes from `GATEWAY_PORT`
/// (default 8080) via [`with_port`](Self::with_port).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub service: ServiceConfig,
    pub openai: UpstreamConfig,
    pub rate_limit: RateLimitConfig,
    #[serde(skip)]
    port: Option<u16>,
}

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub secret_key: String,
    pub users: Vec<String>,
    pub blacklist: Vec<String>,
}

impl std::fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("secret_key", &"<redacted>")
            .field("users", &self.users)
            .field("blacklist", &self.blacklist)
            .finish()
    }
}

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub target_url: String,
    pub api_key: String,
    /// Seconds to wait for upstream response headers; `<= 0` waits forever.
    pub timeout_second: i64,
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("target_url", &self.target_url)
            .field("api_key", &"<redacted>")
            .field("timeout_second", &self.timeout_second)
            .finish()
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Option<Duration> {
        positive_secs(self.timeout_second)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub capacity: i64,
    pub refill_interval_second: i64,
    /// How often idle buckets are swept; `<= 0` disables the sweep.
    pub sweep_interval_second: i64,
}

impl RateLimitConfig {
    pub fn capacity(&self) -> u32 {
        u32::try_from(self.capacity)
            .ok()
            .filter(|c| *c > 0)
            .unwrap_or(DEFAULT_CAPACITY as u32)
    }

    pub fn refill_interval(&self) -> Duration {
        positive_secs(self.refill_interval_second)
            .unwrap_or(Duration::from_secs(DEFAULT_REFILL_INTERVAL_SECS as u64))
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        positive_secs(self.sweep_interval_second)
    }
}

impl GatewayConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Parse a config document and fill in rate-limit defaults for
    /// non-positive values.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_str(raw)?;
        if config.rate_limit.capacity <= 0 {
            config.rate_limit.capacity = DEFAULT_CAPACITY;
        }
        if config.rate_limit.refill_interval_second <= 0 {
            config.rate_limit.refill_interval_second = DEFAULT_REFILL_INTERVAL_SECS;
        }
        Ok(config)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }
}

/// Config file location from the `CONFIG_PATH` value, if set and non-empty.
pub fn config_path(var: Option<String>) -> PathBuf {
    var.filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Listening port from the `GATEWAY_PORT` value; unparsable values fall back to 8080.
pub fn parse_port(var: Option<&str>) -> u16 {
    var.and_then(|p| p.trim().parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

fn positive_secs(secs: i64) -> Option<Duration> {
    u64::try_from(secs)
        .ok()
        .filter(|s| *s > 0)
        .map(Duration::from_secs)
}
