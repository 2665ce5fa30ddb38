use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub logging: LoggingConfig,
    pub gateway: GatewayConfig,
    pub media: MediaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// WebSocket and HTTP endpoints share this port
    pub port: u16,
    pub app_name: String,
    pub app_version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
            app_name: "DriftSee WebSocket Server".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Empty URL runs the gateway in single-instance mode
    pub url: String,
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            key_prefix: "driftsee:".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Connection liveness and command correlation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// How often the heartbeat monitor sweeps connections and refreshes directory entries
    pub heartbeat_interval_seconds: u64,
    /// Maximum silence before a connection is presumed dead
    pub heartbeat_timeout_seconds: u64,
    /// Directory entry TTL; must lie between the interval and the timeout
    pub directory_ttl_seconds: u64,
    /// Budget for a single directory round trip
    pub directory_timeout_ms: u64,
    /// Default time a caller waits for a device acknowledgement
    pub command_timeout_seconds: u64,
    /// Upper bound for caller-requested command timeouts
    pub max_command_timeout_seconds: u64,
    /// How long a remote owner has to confirm receipt of a forwarded command
    pub forward_confirm_timeout_ms: u64,
    /// Commands allowed to wait behind the one in flight for the same device
    pub max_queued_commands: usize,
    /// Outbound frames buffered per connection before sends count as failed
    pub outbound_buffer: usize,
    pub max_frame_bytes: usize,
    pub default_language: String,
    /// WebSocket protocol ping cadence
    pub ws_ping_interval_seconds: u64,
    /// Close a socket that stays silent this long after a ping is due
    pub ws_ping_timeout_seconds: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: 30,
            heartbeat_timeout_seconds: 180,
            directory_ttl_seconds: 90,
            directory_timeout_ms: 2000,
            command_timeout_seconds: 10,
            max_command_timeout_seconds: 60,
            forward_confirm_timeout_ms: 2000,
            max_queued_commands: 8,
            outbound_buffer: 256,
            max_frame_bytes: 64 * 1024,
            default_language: "zh-CN".to_string(),
            ws_ping_interval_seconds: 20,
            ws_ping_timeout_seconds: 30,
        }
    }
}

impl GatewayConfig {
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    #[must_use]
    pub const fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_seconds)
    }

    #[must_use]
    pub const fn directory_ttl(&self) -> Duration {
        Duration::from_secs(self.directory_ttl_seconds)
    }

    #[must_use]
    pub const fn directory_timeout(&self) -> Duration {
        Duration::from_millis(self.directory_timeout_ms)
    }

    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    #[must_use]
    pub const fn max_command_timeout(&self) -> Duration {
        Duration::from_secs(self.max_command_timeout_seconds)
    }

    #[must_use]
    pub const fn forward_confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_confirm_timeout_ms)
    }

    #[must_use]
    pub const fn ws_ping_interval(&self) -> Duration {
        Duration::from_secs(self.ws_ping_interval_seconds)
    }

    #[must_use]
    pub const fn ws_ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ws_ping_timeout_seconds)
    }
}

/// RTMP ingest endpoint handed to devices that ask where to push video
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub video_rtmp_host: String,
    pub video_rtmp_port: u16,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            video_rtmp_host: "127.0.0.1".to_string(),
            video_rtmp_port: 1935,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (`DRIFTSEE_GATEWAY__HEARTBEAT_TIMEOUT_SECONDS`, ...)
    /// 2. Config file (if provided)
    /// 3. Defaults
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Double underscore separates section from key so snake_case keys survive
        builder = builder.add_source(
            Environment::with_prefix("DRIFTSEE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        Self::load(Some(path))
    }

    /// Check cross-field constraints, collecting every violation
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let gw = &self.gateway;

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if gw.heartbeat_interval_seconds == 0 {
            errors.push("gateway.heartbeat_interval_seconds must be positive".to_string());
        }
        if gw.heartbeat_timeout_seconds <= gw.heartbeat_interval_seconds {
            errors.push(format!(
                "gateway.heartbeat_timeout_seconds ({}) must exceed heartbeat_interval_seconds ({})",
                gw.heartbeat_timeout_seconds, gw.heartbeat_interval_seconds
            ));
        }
        if gw.directory_ttl_seconds <= gw.heartbeat_interval_seconds
            || gw.directory_ttl_seconds >= gw.heartbeat_timeout_seconds
        {
            errors.push(format!(
                "gateway.directory_ttl_seconds ({}) must lie strictly between heartbeat_interval_seconds ({}) and heartbeat_timeout_seconds ({})",
                gw.directory_ttl_seconds, gw.heartbeat_interval_seconds, gw.heartbeat_timeout_seconds
            ));
        }
        if gw.directory_timeout_ms == 0 {
            errors.push("gateway.directory_timeout_ms must be positive".to_string());
        }
        if gw.command_timeout_seconds == 0 {
            errors.push("gateway.command_timeout_seconds must be positive".to_string());
        }
        if gw.max_command_timeout_seconds < gw.command_timeout_seconds {
            errors.push(
                "gateway.max_command_timeout_seconds must be at least command_timeout_seconds"
                    .to_string(),
            );
        }
        if gw.forward_confirm_timeout_ms == 0
            || gw.forward_confirm_timeout_ms >= gw.command_timeout_seconds.saturating_mul(1000)
        {
            errors.push(
                "gateway.forward_confirm_timeout_ms must be positive and shorter than the command timeout"
                    .to_string(),
            );
        }
        if gw.ws_ping_interval_seconds == 0 || gw.ws_ping_timeout_seconds == 0 {
            errors.push("gateway.ws_ping_interval_seconds and ws_ping_timeout_seconds must be positive".to_string());
        }
        if gw.outbound_buffer == 0 {
            errors.push("gateway.outbound_buffer must be positive".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got {:?}",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    #[must_use]
    pub fn redis_url(&self) -> &str {
        &self.redis.url
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Multi-instance routing is only possible with a shared Redis
    #[must_use]
    pub fn is_clustered(&self) -> bool {
        !self.redis.url.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(!config.is_clustered());
        assert_eq!(config.http_address(), "0.0.0.0:9000");
    }

    #[test]
    fn test_directory_ttl_must_sit_between_interval_and_timeout() {
        let mut config = Config::default();
        config.gateway.directory_ttl_seconds = config.gateway.heartbeat_interval_seconds;
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("directory_ttl_seconds"));

        config.gateway.directory_ttl_seconds = config.gateway.heartbeat_timeout_seconds;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_collects_every_violation() {
        let mut config = Config::default();
        config.server.port = 0;
        config.gateway.outbound_buffer = 0;
        config.logging.format = "xml".to_string();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_gateway_durations() {
        let gw = GatewayConfig::default();
        assert_eq!(gw.heartbeat_timeout(), Duration::from_secs(180));
        assert_eq!(gw.directory_timeout(), Duration::from_millis(2000));
        assert!(gw.directory_ttl() > gw.heartbeat_interval());
        assert!(gw.directory_ttl() < gw.heartbeat_timeout());
        assert_eq!(gw.ws_ping_interval(), Duration::from_secs(20));
        assert!(gw.ws_ping_interval() + gw.ws_ping_timeout() < gw.heartbeat_timeout());
    }

    #[test]
    fn test_zero_ping_interval_is_rejected() {
        let mut config = Config::default();
        config.gateway.ws_ping_interval_seconds = 0;
        let errors = config.validate().unwrap_err();
        assert!(errors[0].contains("ws_ping_interval_seconds"));
    }
}
