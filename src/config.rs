//! # Configuration Management
//!
//! Centralized settings for the connection runtime.
//!
//! This module provides structured configuration for the login and shard
//! servers, the telemetry channel, and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-variable overrides (`SHARDNET_*`)
//!
//! ## Notes
//! - The keepalive timeout doubles as the slow-loris guard: a silent
//!   client is probed at half the timeout and dropped at the full one
//! - Verbosity maps onto a tracing level; `RUST_LOG` still wins when set

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::Level;

use crate::error::{ProtocolError, Result};

/// Main configuration structure containing all tunable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Settings {
    /// Login server configuration
    #[serde(default)]
    pub login: LoginConfig,

    /// Shard server configuration
    #[serde(default)]
    pub shard: ShardConfig,

    /// Telemetry channel configuration
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Settings {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ProtocolError::ConfigError(format!("failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("failed to parse TOML: {e}")))
    }

    /// Load defaults, then apply environment-variable overrides
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Some(port) = env_parse::<u16>("SHARDNET_LOGIN_PORT") {
            settings.login.port = port;
        }
        if let Some(port) = env_parse::<u16>("SHARDNET_SHARD_PORT") {
            settings.shard.port = port;
        }
        if let Some(secs) = env_parse::<u64>("SHARDNET_TIMEOUT_SECS") {
            settings.shard.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("SHARDNET_DB_SAVE_INTERVAL_SECS") {
            settings.shard.db_save_interval = Duration::from_secs(secs);
        }
        if let Some(enabled) = env_parse::<bool>("SHARDNET_MONITOR_ENABLED") {
            settings.monitor.enabled = enabled;
        }
        if let Some(port) = env_parse::<u16>("SHARDNET_MONITOR_PORT") {
            settings.monitor.port = port;
        }
        if let Some(verbosity) = env_parse::<u8>("SHARDNET_VERBOSITY") {
            settings.logging.verbosity = verbosity;
        }

        settings
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut settings = Self::default();
        mutator(&mut settings);
        settings
    }

    /// Validate the configuration for common misconfigurations.
    ///
    /// Returns a list of validation errors; empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.login.port == self.shard.port {
            errors.push(format!(
                "login and shard cannot share port {}",
                self.login.port
            ));
        }

        errors.extend(self.shard.validate());
        errors.extend(self.monitor.validate(self.shard.port, self.login.port));
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn bind_any(port: u16) -> Result<SocketAddr> {
    Ok(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
}

/// Login server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoginConfig {
    /// Listener port
    pub port: u16,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self { port: 23_000 }
    }
}

impl LoginConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        bind_any(self.port)
    }
}

/// Shard server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShardConfig {
    /// Listener port
    pub port: u16,

    /// Client silence before a forced disconnect; a live check goes out
    /// at half this value
    #[serde(with = "duration_serde")]
    pub timeout: Duration,

    /// Interval between periodic database saves
    #[serde(with = "duration_serde")]
    pub db_save_interval: Duration,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            port: 23_001,
            timeout: Duration::from_secs(60),
            db_save_interval: Duration::from_secs(240),
        }
    }
}

impl ShardConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        bind_any(self.port)
    }

    /// Validate shard configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.timeout.as_secs() < 8 {
            errors.push("shard timeout too short (minimum: 8s, keepalive runs at 4s)".to_string());
        } else if self.timeout.as_secs() > 3600 {
            errors.push("shard timeout too long (maximum: 1 hour)".to_string());
        }

        if self.db_save_interval.as_secs() < 10 {
            errors.push("db save interval too short (minimum: 10s)".to_string());
        }

        errors
    }
}

/// Telemetry channel configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorConfig {
    /// Whether the channel is served at all
    pub enabled: bool,

    /// Listener port
    pub port: u16,

    /// Interval between telemetry frames
    #[serde(with = "duration_serde")]
    pub interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8_003,
            interval: Duration::from_secs(5),
        }
    }
}

impl MonitorConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        bind_any(self.port)
    }

    /// Validate monitor configuration
    pub fn validate(&self, shard_port: u16, login_port: u16) -> Vec<String> {
        let mut errors = Vec::new();

        if !self.enabled {
            return errors;
        }

        if self.port == shard_port || self.port == login_port {
            errors.push(format!("monitor port {} collides with a game port", self.port));
        }

        if self.interval.as_millis() < 100 {
            errors.push("monitor interval too short (minimum: 100ms)".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// 0 = warnings only, 1 = info, 2 = debug, 3+ = trace
    pub verbosity: u8,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { verbosity: 1 }
    }
}

impl LoggingConfig {
    /// The tracing level the configured verbosity maps to
    pub fn level(&self) -> Level {
        match self.verbosity {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }
}

/// Helper module for Duration serialization as whole seconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_cleanly() {
        assert!(Settings::default().validate().is_empty());
    }

    #[test]
    fn toml_roundtrip() {
        let settings = Settings::from_toml(
            r#"
            [shard]
            port = 24001
            timeout = 90
            db_save_interval = 120

            [monitor]
            enabled = true
            port = 9003
            interval = 2
            "#,
        )
        .unwrap();

        assert_eq!(settings.shard.port, 24_001);
        assert_eq!(settings.shard.timeout, Duration::from_secs(90));
        assert!(settings.monitor.enabled);
        assert_eq!(settings.monitor.interval, Duration::from_secs(2));
        // unspecified sections keep their defaults
        assert_eq!(settings.login.port, 23_000);
    }

    #[test]
    fn bad_timeout_is_flagged() {
        let settings = Settings::default_with_overrides(|s| {
            s.shard.timeout = Duration::from_secs(2);
        });

        let errors = settings.validate();
        assert!(errors.iter().any(|e| e.contains("timeout too short")));
        assert!(settings.validate_strict().is_err());
    }

    #[test]
    fn port_collisions_are_flagged() {
        let settings = Settings::default_with_overrides(|s| {
            s.monitor.enabled = true;
            s.monitor.port = s.shard.port;
        });

        assert!(!settings.validate().is_empty());
    }

    #[test]
    fn verbosity_maps_to_levels() {
        let mut logging = LoggingConfig { verbosity: 0 };
        assert_eq!(logging.level(), Level::WARN);
        logging.verbosity = 2;
        assert_eq!(logging.level(), Level::DEBUG);
        logging.verbosity = 9;
        assert_eq!(logging.level(), Level::TRACE);
    }
}
