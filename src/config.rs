//! Configuration loading.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. `--config <path>` (CLI flag, must exist)
//! 2. `~/.mimir/config.toml` (user)
//! 3. `/etc/mimir/config.toml` (system)
//!
//! When no file is found the built-in defaults are used. Every section and
//! field is optional. Values are static for the lifetime of the process.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::CacheConfig;
use crate::limiter::LimiterConfig;
use crate::providers::{OllamaConfig, RetryConfig};
use crate::queue::QueueConfig;
use crate::{MimirError, Result};

/// Service configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Default tracing filter when `RUST_LOG` is unset (default: "info").
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub cache: CachesConfig,
    #[serde(default)]
    pub rate_limit: RateLimitsConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            queue: QueueConfig::default(),
            cache: CachesConfig::default(),
            rate_limit: RateLimitsConfig::default(),
            ollama: OllamaConfig::default(),
            retry: RetryConfig::default(),
            retrieval: RetrievalConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

/// One cache per purpose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachesConfig {
    /// Similarity-search results (default: 512 entries, 30 minutes).
    #[serde(default = "CacheConfig::search")]
    pub search: CacheConfig,
    /// Full model answers (default: 256 entries, 1 hour).
    #[serde(default = "CacheConfig::response")]
    pub response: CacheConfig,
}

impl Default for CachesConfig {
    fn default() -> Self {
        Self {
            search: CacheConfig::search(),
            response: CacheConfig::response(),
        }
    }
}

/// One limiter per endpoint class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitsConfig {
    #[serde(default = "LimiterConfig::chat")]
    pub chat: LimiterConfig,
    #[serde(default = "LimiterConfig::upload")]
    pub upload: LimiterConfig,
    #[serde(default = "LimiterConfig::general")]
    pub general: LimiterConfig,
    /// Key clients by the first `X-Forwarded-For` entry. Only enable behind
    /// a proxy that overwrites the header (default: false).
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            chat: LimiterConfig::chat(),
            upload: LimiterConfig::upload(),
            general: LimiterConfig::general(),
            trust_forwarded_for: false,
        }
    }
}

/// Retrieval parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Chunks retrieved per question (default: 4).
    #[serde(default = "default_k")]
    pub k: usize,
}

fn default_k() -> usize {
    4
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { k: default_k() }
    }
}

/// Periodic cache and limiter sweeps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Seconds between sweeps (default: 300).
    #[serde(
        rename = "interval_secs",
        default = "default_maintenance_interval",
        with = "duration_secs"
    )]
    pub interval: Duration,
}

fn default_maintenance_interval() -> Duration {
    Duration::from_secs(300)
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: default_maintenance_interval(),
        }
    }
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided; an error if missing)
    /// 2. `~/.mimir/config.toml`
    /// 3. `/etc/mimir/config.toml`
    /// 4. Built-in defaults
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let Some(path) = Self::resolve_config_path(explicit_path)? else {
            info!("no config file found, using defaults");
            return Ok(Self::default());
        };

        let content = fs::read_to_string(&path).map_err(|e| {
            MimirError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        let config = Self::from_toml(&content).map_err(|e| match e {
            MimirError::Configuration(msg) => {
                MimirError::Configuration(format!("{msg} (in {path:?})"))
            }
            other => other,
        })?;

        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| MimirError::Configuration(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the components cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.queue.max_concurrent == 0 {
            return Err(invalid("queue.max_concurrent must be at least 1"));
        }
        if self.queue.max_queue_size == 0 {
            return Err(invalid("queue.max_queue_size must be at least 1"));
        }
        if self.queue.poll_interval.is_zero() {
            return Err(invalid("queue.poll_interval_ms must be positive"));
        }
        for (name, cache) in [
            ("search", &self.cache.search),
            ("response", &self.cache.response),
        ] {
            if cache.max_size == 0 {
                return Err(invalid(&format!("cache.{name}.max_size must be at least 1")));
            }
            if cache.ttl.is_zero() {
                return Err(invalid(&format!("cache.{name}.ttl_seconds must be positive")));
            }
        }
        for (name, limiter) in [
            ("chat", &self.rate_limit.chat),
            ("upload", &self.rate_limit.upload),
            ("general", &self.rate_limit.general),
        ] {
            if limiter.max_tokens == 0 {
                return Err(invalid(&format!(
                    "rate_limit.{name}.max_tokens must be at least 1"
                )));
            }
            if !limiter.refill_rate.is_finite() || limiter.refill_rate < 0.0 {
                return Err(invalid(&format!(
                    "rate_limit.{name}.refill_rate must be a non-negative number"
                )));
            }
            // Stale-bucket sweeps are measured in windows.
            if limiter.window.is_zero() {
                return Err(invalid(&format!(
                    "rate_limit.{name}.window_seconds must be positive"
                )));
            }
        }
        if self.retrieval.k == 0 {
            return Err(invalid("retrieval.k must be at least 1"));
        }
        if self.maintenance.interval.is_zero() {
            return Err(invalid("maintenance.interval_secs must be positive"));
        }
        Ok(())
    }

    /// Resolve the config file path, `None` when no file exists.
    fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(Some(path.to_path_buf()));
            }
            return Err(MimirError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        // User config
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".mimir").join("config.toml");
            if user_config.exists() {
                return Ok(Some(user_config));
            }
        }

        // System config
        let system_config = PathBuf::from("/etc/mimir/config.toml");
        if system_config.exists() {
            return Ok(Some(system_config));
        }

        Ok(None)
    }
}

fn invalid(msg: &str) -> MimirError {
    MimirError::Configuration(msg.to_string())
}

/// `Duration` as whole seconds in config files.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// `Duration` as milliseconds in config files.
pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
