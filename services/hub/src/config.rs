//! Hub configuration loading.
//!
//! TOML is the sole config source; every field has a default so an absent
//! file yields a fully usable config. Default config path:
//! `/etc/pulse/hub.toml`, overridable via the `HUB_CONFIG` env var.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub server: ServerConfig,
    pub heartbeat: HeartbeatConfig,
    pub limits: LimitsConfig,
    pub broadcast: BroadcastConfig,
    pub history: HistoryConfig,
    pub detector: DetectorConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Shared secret for the privileged broadcast endpoint. Absent means the
    /// endpoint rejects every request.
    pub admin_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Client ping cadence advertised in the `connected` greeting.
    pub interval_ms: u64,
    /// Sweep eviction threshold.
    pub timeout_ms: u64,
    /// Sweep cadence, independent of the heartbeat period.
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct LimitsConfig {
    pub max_connections_per_user: usize,
    pub max_total_connections: usize,
    /// Outbound frames whose serialized size exceeds this are dropped.
    pub max_message_size: usize,
    pub max_queue_size: usize,
    /// Advertised to clients in the `connected` greeting.
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub default_limit: usize,
    pub max_limit: usize,
    /// Ring-buffer capacity per message type.
    pub capacity: usize,
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub sample_interval_ms: u64,
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    pub disk_threshold: f64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind: "0.0.0.0:8080".to_owned(),
                admin_token: None,
            },
            heartbeat: HeartbeatConfig {
                interval_ms: 30_000,
                timeout_ms: 60_000,
                sweep_interval_ms: 60_000,
            },
            limits: LimitsConfig {
                max_connections_per_user: 3,
                max_total_connections: 10_000,
                max_message_size: 64 * 1024,
                max_queue_size: 1_000,
                max_reconnect_attempts: 5,
            },
            broadcast: BroadcastConfig {
                batch_size: 100,
                flush_interval_ms: 50,
            },
            history: HistoryConfig {
                default_limit: 50,
                max_limit: 100,
                capacity: 500,
            },
            detector: DetectorConfig {
                sample_interval_ms: 1_000,
                cpu_threshold: 80.0,
                memory_threshold: 85.0,
                disk_threshold: 90.0,
            },
        }
    }
}

impl HubConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat.timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast.flush_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    server: Option<RawServerConfig>,
    heartbeat: Option<RawHeartbeatConfig>,
    limits: Option<RawLimitsConfig>,
    broadcast: Option<RawBroadcastConfig>,
    history: Option<RawHistoryConfig>,
    detector: Option<RawDetectorConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RawServerConfig {
    bind: Option<String>,
    admin_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawHeartbeatConfig {
    interval_ms: Option<u64>,
    timeout_ms: Option<u64>,
    sweep_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawLimitsConfig {
    max_connections_per_user: Option<usize>,
    max_total_connections: Option<usize>,
    max_message_size: Option<usize>,
    max_queue_size: Option<usize>,
    max_reconnect_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RawBroadcastConfig {
    batch_size: Option<usize>,
    flush_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawHistoryConfig {
    default_limit: Option<usize>,
    max_limit: Option<usize>,
    capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDetectorConfig {
    sample_interval_ms: Option<u64>,
    cpu_threshold: Option<f64>,
    memory_threshold: Option<f64>,
    disk_threshold: Option<f64>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl HubConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Parse config from TOML text, applying defaults for absent fields.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text)?;
        let defaults = HubConfig::default();

        let server = raw.server.unwrap_or_default();
        let heartbeat = raw.heartbeat.unwrap_or_default();
        let limits = raw.limits.unwrap_or_default();
        let broadcast = raw.broadcast.unwrap_or_default();
        let history = raw.history.unwrap_or_default();
        let detector = raw.detector.unwrap_or_default();

        let config = HubConfig {
            server: ServerConfig {
                bind: server.bind.unwrap_or(defaults.server.bind),
                admin_token: server.admin_token,
            },
            heartbeat: HeartbeatConfig {
                interval_ms: heartbeat.interval_ms.unwrap_or(defaults.heartbeat.interval_ms),
                timeout_ms: heartbeat.timeout_ms.unwrap_or(defaults.heartbeat.timeout_ms),
                sweep_interval_ms: heartbeat
                    .sweep_interval_ms
                    .unwrap_or(defaults.heartbeat.sweep_interval_ms),
            },
            limits: LimitsConfig {
                max_connections_per_user: limits
                    .max_connections_per_user
                    .unwrap_or(defaults.limits.max_connections_per_user),
                max_total_connections: limits
                    .max_total_connections
                    .unwrap_or(defaults.limits.max_total_connections),
                max_message_size: limits
                    .max_message_size
                    .unwrap_or(defaults.limits.max_message_size),
                max_queue_size: limits.max_queue_size.unwrap_or(defaults.limits.max_queue_size),
                max_reconnect_attempts: limits
                    .max_reconnect_attempts
                    .unwrap_or(defaults.limits.max_reconnect_attempts),
            },
            broadcast: BroadcastConfig {
                batch_size: broadcast.batch_size.unwrap_or(defaults.broadcast.batch_size),
                flush_interval_ms: broadcast
                    .flush_interval_ms
                    .unwrap_or(defaults.broadcast.flush_interval_ms),
            },
            history: HistoryConfig {
                default_limit: history.default_limit.unwrap_or(defaults.history.default_limit),
                max_limit: history.max_limit.unwrap_or(defaults.history.max_limit),
                capacity: history.capacity.unwrap_or(defaults.history.capacity),
            },
            detector: DetectorConfig {
                sample_interval_ms: detector
                    .sample_interval_ms
                    .unwrap_or(defaults.detector.sample_interval_ms),
                cpu_threshold: detector.cpu_threshold.unwrap_or(defaults.detector.cpu_threshold),
                memory_threshold: detector
                    .memory_threshold
                    .unwrap_or(defaults.detector.memory_threshold),
                disk_threshold: detector
                    .disk_threshold
                    .unwrap_or(defaults.detector.disk_threshold),
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_queue_size == 0 {
            return Err(ConfigError::Invalid("limits.max_queue_size must be >= 1".into()));
        }
        if self.broadcast.batch_size == 0 {
            return Err(ConfigError::Invalid("broadcast.batch_size must be >= 1".into()));
        }
        if self.history.max_limit == 0 || self.history.default_limit > self.history.max_limit {
            return Err(ConfigError::Invalid(
                "history.default_limit must be within [1, history.max_limit]".into(),
            ));
        }
        if self.heartbeat.timeout_ms < self.heartbeat.interval_ms {
            return Err(ConfigError::Invalid(
                "heartbeat.timeout_ms must be >= heartbeat.interval_ms".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = HubConfig::from_toml("").expect("empty config is valid");
        assert_eq!(config.heartbeat.interval_ms, 30_000);
        assert_eq!(config.heartbeat.timeout_ms, 60_000);
        assert_eq!(config.limits.max_connections_per_user, 3);
        assert_eq!(config.limits.max_total_connections, 10_000);
        assert_eq!(config.limits.max_queue_size, 1_000);
        assert_eq!(config.limits.max_message_size, 64 * 1024);
        assert_eq!(config.broadcast.batch_size, 100);
        assert_eq!(config.broadcast.flush_interval_ms, 50);
        assert_eq!(config.history.default_limit, 50);
        assert_eq!(config.detector.sample_interval_ms, 1_000);
        assert!(config.server.admin_token.is_none());
    }

    #[test]
    fn partial_sections_override_only_named_fields() {
        let config = HubConfig::from_toml(
            r#"
            [limits]
            max_connections_per_user = 5

            [broadcast]
            flush_interval_ms = 10
            "#,
        )
        .expect("partial config is valid");
        assert_eq!(config.limits.max_connections_per_user, 5);
        assert_eq!(config.limits.max_total_connections, 10_000);
        assert_eq!(config.broadcast.flush_interval_ms, 10);
        assert_eq!(config.broadcast.batch_size, 100);
    }

    #[test]
    fn zero_queue_size_is_rejected() {
        let err = HubConfig::from_toml("[limits]\nmax_queue_size = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn timeout_shorter_than_interval_is_rejected() {
        let err = HubConfig::from_toml(
            "[heartbeat]\ninterval_ms = 30000\ntimeout_ms = 10000\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
