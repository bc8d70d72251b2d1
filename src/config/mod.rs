//! Configuration Module
//!
//! Provides TOML-based configuration for RelayMQ with support for:
//! - Server settings (bind address)
//! - Connection and in-flight limits
//! - MQTT matching options
//! - Metrics endpoint
//! - Environment variable overrides (RELAYMQ__* prefix)

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::broker::BrokerConfig;
use crate::protocol::QoS;
use crate::topic::SegmentPolicy;

pub use metrics::MetricsConfig;

mod metrics;


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let Ok(re) = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") else {
        return content.to_string();
    };
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
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
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Server configuration
    pub server: ServerConfig,
    /// Connection limits
    pub limits: LimitsConfig,
    /// MQTT feature configuration
    pub mqtt: MqttConfig,
    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 1883)),
        }
    }
}

/// Connection limits configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum number of connections
    pub max_connections: usize,
    /// Maximum packet size in bytes
    pub max_packet_size: usize,
    /// Maximum in-flight messages per client (QoS 1/2, 0 = unlimited)
    pub max_inflight: usize,
    /// Outgoing publishes queued per client while in-flight is full
    pub max_queued_messages: usize,
    /// Seconds before retrying unacked messages
    pub retry_interval: u64,
    /// Per-connection outbound message channel capacity.
    /// Deliveries beyond it are dropped for that client only.
    pub outbound_channel_capacity: usize,
    /// Seconds a new connection has to send CONNECT
    pub connect_timeout: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 100_000,
            max_packet_size: 1024 * 1024,
            max_inflight: 32,
            max_queued_messages: 1000,
            retry_interval: 30,
            outbound_channel_capacity: 1024,
            connect_timeout: 30,
        }
    }
}

impl LimitsConfig {
    /// Get retry interval as Duration
    pub fn retry_interval_duration(&self) -> Duration {
        Duration::from_secs(self.retry_interval)
    }

    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

/// MQTT feature configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Maximum QoS level (0, 1, or 2)
    pub max_qos: u8,
    /// Empty topic levels: "preserve" or "collapse"
    pub empty_segments: SegmentPolicy,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_qos: 2,
            empty_segments: SegmentPolicy::Preserve,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `RELAYMQ__` prefix with double underscores for nesting:
    ///    - `RELAYMQ__SERVER__BIND=0.0.0.0:1884` overrides `server.bind`
    ///    - `RELAYMQ__LIMITS__MAX_CONNECTIONS=50000` overrides `limits.max_connections`
    ///
    /// A missing file is not an error; defaults and env vars still apply.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let mut builder = config::Config::builder()
            .set_default("log.level", defaults.log.level)?
            .set_default("server.bind", defaults.server.bind.to_string())?
            .set_default("limits.max_connections", defaults.limits.max_connections as u64)?
            .set_default("limits.max_packet_size", defaults.limits.max_packet_size as u64)?
            .set_default("limits.max_inflight", defaults.limits.max_inflight as u64)?
            .set_default(
                "limits.max_queued_messages",
                defaults.limits.max_queued_messages as u64,
            )?
            .set_default("limits.retry_interval", defaults.limits.retry_interval)?
            .set_default(
                "limits.outbound_channel_capacity",
                defaults.limits.outbound_channel_capacity as u64,
            )?
            .set_default("limits.connect_timeout", defaults.limits.connect_timeout)?
            .set_default("mqtt.max_qos", defaults.mqtt.max_qos as u64)?
            .set_default("mqtt.empty_segments", "preserve")?
            .set_default("metrics.enabled", defaults.metrics.enabled)?
            .set_default("metrics.bind", defaults.metrics.bind.to_string())?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
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
                Environment::with_prefix("RELAYMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.max_qos > 2 {
            return Err(ConfigError::Validation(
                "max_qos must be 0, 1, or 2".to_string(),
            ));
        }
        if self.limits.max_connections == 0 {
            return Err(ConfigError::Validation(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.limits.max_packet_size == 0 {
            return Err(ConfigError::Validation(
                "max_packet_size must be at least 1".to_string(),
            ));
        }
        if self.limits.max_packet_size > crate::codec::MAX_REMAINING_LENGTH {
            return Err(ConfigError::Validation(format!(
                "max_packet_size must not exceed {}",
                crate::codec::MAX_REMAINING_LENGTH
            )));
        }
        if self.limits.outbound_channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "outbound_channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.limits.retry_interval == 0 {
            return Err(ConfigError::Validation(
                "retry_interval must be at least 1 second".to_string(),
            ));
        }
        Ok(())
    }

    /// Broker settings derived from this configuration
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            bind_addr: self.server.bind,
            max_connections: self.limits.max_connections,
            max_packet_size: self.limits.max_packet_size,
            connect_timeout: self.limits.connect_timeout_duration(),
            max_qos: QoS::from_u8(self.mqtt.max_qos).unwrap_or(QoS::ExactlyOnce),
            max_inflight: self.limits.max_inflight,
            max_pending: self.limits.max_queued_messages,
            retry_interval: self.limits.retry_interval_duration(),
            outbound_channel_capacity: self.limits.outbound_channel_capacity,
            segment_policy: self.mqtt.empty_segments,
        }
    }
}
