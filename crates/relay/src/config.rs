//! Relay configuration.
//!
//! Loaded from a TOML file, with deployment-specific knobs overridable
//! through the environment (`DATABASE_URL`, `REDIS_URL`, `RELAY_LOG_LEVEL`,
//! `RELAY_METRICS_PORT`). Every field has a default so an empty file is a
//! runnable configuration.

use common::GatewayEndpoint;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub upstream: UpstreamConfig,
    pub fanout: FanoutConfig,
    pub cache: CacheConfig,
    pub rate: RateConfig,
    pub auth: AuthConfig,
    pub usage: UsageConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub telemetry: TelemetryConfig,
}

impl RelayConfig {
    /// Load from a TOML file and apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: RelayConfig = toml::from_str(&content)?;
        config.apply_env();
        Ok(config)
    }

    /// Environment overrides for deployment knobs.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            self.redis.url = Some(url);
        }
        if let Ok(level) = std::env::var("RELAY_LOG_LEVEL") {
            self.telemetry.log_level = level;
        }
        if let Ok(port) = std::env::var("RELAY_METRICS_PORT") {
            if let Ok(port) = port.parse() {
                self.telemetry.metrics_port = port;
            }
        }
    }
}

/// Upstream gateway settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Gateways in no particular order; the manager sorts by priority.
    pub gateways: Vec<GatewayEndpoint>,
    pub health_check_interval_secs: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            gateways: Vec::new(),
            health_check_interval_secs: 5,
            reconnect_base_delay_ms: 100,
            reconnect_max_delay_secs: 30,
        }
    }
}

impl UpstreamConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_delay_secs)
    }
}

/// Fan-out hub settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    pub subscriber_buffer_size: usize,
    pub slow_consumer_threshold: u64,
    pub zombie_timeout_secs: u64,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer_size: 500,
            slow_consumer_threshold: 1000,
            zombie_timeout_secs: 60,
        }
    }
}

impl FanoutConfig {
    pub fn zombie_timeout(&self) -> Duration {
        Duration::from_secs(self.zombie_timeout_secs)
    }
}

/// Cache settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_orderbook_depth: usize,
    pub trade_history_size: usize,
    pub cleanup_interval_secs: u64,
    /// Snapshots older than this are dropped by the cleanup pass.
    pub stale_after_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_orderbook_depth: 100,
            trade_history_size: 1000,
            cleanup_interval_secs: 300,
            stale_after_secs: 3600,
        }
    }
}

impl CacheConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// Rate limiter settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    pub default_rps: u32,
    pub default_max_streams: u32,
    pub burst_multiplier: f64,
    pub cleanup_interval_secs: u64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            default_rps: 100,
            default_max_streams: 10,
            burst_multiplier: 2.0,
            cleanup_interval_secs: 300,
        }
    }
}

impl RateConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Auth gate settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub cache_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { cache_ttl_secs: 300 }
    }
}

impl AuthConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Usage accounting settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    pub flush_interval_secs: u64,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 60,
        }
    }
}

impl UsageConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

/// Postgres settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/relay".to_string(),
            max_connections: 10,
            acquire_timeout_secs: 30,
        }
    }
}

/// Redis settings. `url = None` disables the distributed auth cache.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: Option<String>,
}

/// Logging and metrics settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub metrics_port: u16,
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            metrics_port: 9090,
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: RelayConfig = toml::from_str("").unwrap();
        assert_eq!(config.upstream.health_check_interval_secs, 5);
        assert_eq!(config.upstream.reconnect_base_delay_ms, 100);
        assert_eq!(config.upstream.reconnect_max_delay_secs, 30);
        assert_eq!(config.fanout.subscriber_buffer_size, 500);
        assert_eq!(config.fanout.slow_consumer_threshold, 1000);
        assert_eq!(config.fanout.zombie_timeout_secs, 60);
        assert_eq!(config.cache.max_orderbook_depth, 100);
        assert_eq!(config.cache.trade_history_size, 1000);
        assert_eq!(config.rate.default_rps, 100);
        assert_eq!(config.rate.default_max_streams, 10);
        assert_eq!(config.rate.burst_multiplier, 2.0);
        assert_eq!(config.auth.cache_ttl_secs, 300);
    }

    #[test]
    fn parses_gateways() {
        let toml = r#"
            [[upstream.gateways]]
            endpoint = "wss://gw-primary.example.com/ws"
            priority = 1
            region = "fra"

            [[upstream.gateways]]
            endpoint = "wss://gw-standby.example.com/ws"
            priority = 2
            region = "ams"

            [fanout]
            subscriber_buffer_size = 64

            [redis]
            url = "redis://localhost:6379"
        "#;
        let config: RelayConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.upstream.gateways.len(), 2);
        assert_eq!(config.upstream.gateways[0].priority, 1);
        assert_eq!(config.fanout.subscriber_buffer_size, 64);
        assert_eq!(config.redis.url.as_deref(), Some("redis://localhost:6379"));
    }
}
