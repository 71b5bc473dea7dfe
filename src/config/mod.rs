//! Configuration Module
//!
//! Provides TOML-based configuration for the relay with support for:
//! - Logging
//! - Broker connection settings
//! - Reconnect backoff and supervisor cadence
//! - Rate limits, cooldowns and table retention
//! - Display preferences
//! - Channel key secrets
//! - Environment variable overrides (CHATRELAY__* prefix)

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::transport::MqttOptions;

#[cfg(test)]
mod tests;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Logging configuration
    pub log: LogConfig,
    /// Broker connection
    pub broker: BrokerConfig,
    /// Reconnect backoff
    pub reconnect: ReconnectConfig,
    /// Rate limits and table retention
    pub limits: LimitsConfig,
    /// Initial display preferences
    pub display: DisplayConfig,
    /// Channel key secrets
    pub keys: KeyConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit ANSI colours
    pub ansi: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            ansi: true,
        }
    }
}

/// Broker connection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker address (host:port)
    pub address: String,
    /// MQTT keep alive in seconds
    pub keepalive: u16,
    /// Connect timeout (e.g., "30s")
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// SUBACK/UNSUBACK timeout
    #[serde(with = "humantime_serde")]
    pub ack_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: "localhost:1883".to_string(),
            keepalive: 60,
            connect_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
        }
    }
}

impl BrokerConfig {
    pub fn mqtt_options(&self) -> MqttOptions {
        MqttOptions {
            address: self.address.clone(),
            keepalive: self.keepalive,
            connect_timeout: self.connect_timeout,
            ack_timeout: self.ack_timeout,
        }
    }
}

/// Reconnect backoff configuration
///
/// delay = min(max_delay, base_delay * 2^min(attempts / 3, max_exponent))
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first retries
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Upper bound on the delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Cap on the doubling exponent
    pub max_exponent: u32,
    /// How often the supervisor checks the connection
    #[serde(with = "humantime_serde")]
    pub supervisor_interval: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(300),
            max_exponent: 5,
            supervisor_interval: Duration::from_secs(10),
        }
    }
}

/// Rate limits and retention windows
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Minimum interval between publishes per sender
    #[serde(with = "humantime_serde")]
    pub min_publish_interval: Duration,
    /// Minimum interval between user-visible errors per partition
    #[serde(with = "humantime_serde")]
    pub error_cooldown: Duration,
    /// Channels idle for longer than this are detached
    #[serde(with = "humantime_serde")]
    pub idle_reclaim: Duration,
    /// How often tables are swept and idle channels reclaimed
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// How long a sender's last body is remembered
    #[serde(with = "humantime_serde")]
    pub dedup_retention: Duration,
    /// How long a cached combat level is trusted
    #[serde(with = "humantime_serde")]
    pub combat_cache_retention: Duration,
    /// Longer sender names are dropped as malformed
    pub max_display_name_len: usize,
    /// Speech bubble lifetime in game ticks
    pub overhead_text_ticks: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            min_publish_interval: Duration::from_millis(100),
            error_cooldown: Duration::from_secs(30 * 60),
            idle_reclaim: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(2 * 60),
            dedup_retention: Duration::from_secs(60 * 60),
            combat_cache_retention: Duration::from_secs(60 * 60),
            max_display_name_len: 12,
            overhead_text_ticks: 5,
        }
    }
}

/// Initial display preferences
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Never publish, only receive
    pub read_only: bool,
    /// Hide known scripted phrases
    pub hide_spam: bool,
    /// Hide world messages from senders below this combat level
    pub min_combat_level: u16,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            hide_spam: true,
            min_combat_level: 4,
        }
    }
}

/// Channel key secrets
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    /// Secret for every non-private topic
    pub shared_secret: String,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            shared_secret: "pub".to_string(),
        }
    }
}

/// Combat level bounds accepted by the low-level filter
pub const COMBAT_LEVEL_RANGE: std::ops::RangeInclusive<u16> = 3..=126;

impl RelayConfig {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `CHATRELAY__` prefix with double underscores for nesting:
    ///    - `CHATRELAY__BROKER__ADDRESS=mqtt.example:1883` overrides `broker.address`
    ///    - `CHATRELAY__LIMITS__MIN_PUBLISH_INTERVAL=250ms` overrides `limits.min_publish_interval`
    ///    - `CHATRELAY__DISPLAY__READ_ONLY=true` overrides `display.read_only`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("log.ansi", true)?
            .set_default("broker.address", "localhost:1883")?
            .set_default("broker.keepalive", 60)?
            .set_default("broker.connect_timeout", "30s")?
            .set_default("broker.ack_timeout", "10s")?
            .set_default("reconnect.base_delay", "10s")?
            .set_default("reconnect.max_delay", "5m")?
            .set_default("reconnect.max_exponent", 5)?
            .set_default("reconnect.supervisor_interval", "10s")?
            .set_default("limits.min_publish_interval", "100ms")?
            .set_default("limits.error_cooldown", "30m")?
            .set_default("limits.idle_reclaim", "5m")?
            .set_default("limits.sweep_interval", "2m")?
            .set_default("limits.dedup_retention", "1h")?
            .set_default("limits.combat_cache_retention", "1h")?
            .set_default("limits.max_display_name_len", 12)?
            .set_default("limits.overhead_text_ticks", 5)?
            .set_default("display.read_only", false)?
            .set_default("display.hide_spam", true)?
            .set_default("display.min_combat_level", 4)?
            .set_default("keys.shared_secret", "pub")?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("CHATRELAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: RelayConfig = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.address.trim().is_empty() {
            return Err(ConfigError::Validation(
                "broker.address cannot be empty".to_string(),
            ));
        }

        if self.broker.keepalive == 0 {
            return Err(ConfigError::Validation(
                "broker.keepalive must be at least 1 second".to_string(),
            ));
        }

        if self.reconnect.base_delay.is_zero() {
            return Err(ConfigError::Validation(
                "reconnect.base_delay must be non-zero".to_string(),
            ));
        }

        if self.reconnect.base_delay > self.reconnect.max_delay {
            return Err(ConfigError::Validation(format!(
                "reconnect.base_delay ({:?}) exceeds reconnect.max_delay ({:?})",
                self.reconnect.base_delay, self.reconnect.max_delay
            )));
        }

        if self.reconnect.supervisor_interval.is_zero() {
            return Err(ConfigError::Validation(
                "reconnect.supervisor_interval must be non-zero".to_string(),
            ));
        }

        if self.limits.min_publish_interval.is_zero() {
            return Err(ConfigError::Validation(
                "limits.min_publish_interval must be non-zero".to_string(),
            ));
        }

        if self.limits.sweep_interval.is_zero() {
            return Err(ConfigError::Validation(
                "limits.sweep_interval must be non-zero".to_string(),
            ));
        }

        if !COMBAT_LEVEL_RANGE.contains(&self.display.min_combat_level) {
            return Err(ConfigError::Validation(format!(
                "display.min_combat_level must be between {} and {}",
                COMBAT_LEVEL_RANGE.start(),
                COMBAT_LEVEL_RANGE.end()
            )));
        }

        if self.keys.shared_secret.is_empty() {
            return Err(ConfigError::Validation(
                "keys.shared_secret cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}
