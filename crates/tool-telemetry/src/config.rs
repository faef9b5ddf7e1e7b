use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Largest query window the aggregator accepts (31 days).
pub const MAX_WINDOW_HOURS: u32 = 24 * 31;

/// Root telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// WebSocket endpoint the live feed is read from
    #[serde(default = "default_transport_url", alias = "transportUrl")]
    pub transport_url: String,
    /// Delay before the first reconnect attempt; doubles per attempt
    #[serde(default = "default_base_reconnect_delay", alias = "baseReconnectDelayMs")]
    pub base_reconnect_delay_ms: u64,
    /// Reconnect attempts before the transport gives up
    #[serde(default = "default_max_reconnect_attempts", alias = "maxReconnectAttempts")]
    pub max_reconnect_attempts: u32,
    /// Default query window for the series
    #[serde(default = "default_bucket_window_hours", alias = "bucketWindowHours")]
    pub bucket_window_hours: u32,
    /// Maximum number of events held in memory
    #[serde(default = "default_store_capacity", alias = "storeCapacity")]
    pub store_capacity: usize,
    /// Optional time horizon; older events are evicted even below capacity
    #[serde(default, alias = "retentionHours")]
    pub retention_hours: Option<u32>,
    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout", alias = "connectTimeoutMs")]
    pub connect_timeout_ms: u64,
}

fn default_transport_url() -> String {
    "ws://localhost:8080/ws".to_string()
}

fn default_base_reconnect_delay() -> u64 {
    1000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_bucket_window_hours() -> u32 {
    24
}

fn default_store_capacity() -> usize {
    10_000
}

fn default_connect_timeout() -> u64 {
    10000 // 10 seconds
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            transport_url: default_transport_url(),
            base_reconnect_delay_ms: default_base_reconnect_delay(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            bucket_window_hours: default_bucket_window_hours(),
            store_capacity: default_store_capacity(),
            retention_hours: None,
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl TelemetryConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.transport_url.starts_with("ws://") || self.transport_url.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "transport_url must be a ws:// or wss:// URL, got '{}'",
                self.transport_url
            )));
        }
        if self.store_capacity == 0 {
            return Err(ConfigError::Invalid("store_capacity must be at least 1".into()));
        }
        if self.bucket_window_hours == 0 || self.bucket_window_hours > MAX_WINDOW_HOURS {
            return Err(ConfigError::Invalid(format!(
                "bucket_window_hours must be in 1..={}",
                MAX_WINDOW_HOURS
            )));
        }
        if let Some(retention) = self.retention_hours {
            if retention < self.bucket_window_hours {
                return Err(ConfigError::Invalid(format!(
                    "retention_hours ({}) is shorter than bucket_window_hours ({})",
                    retention, self.bucket_window_hours
                )));
            }
        }
        Ok(())
    }

    pub fn base_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.base_reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retention(&self) -> Option<chrono::Duration> {
        self.retention_hours
            .map(|hours| chrono::Duration::hours(i64::from(hours)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.base_reconnect_delay_ms, 1000);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.bucket_window_hours, 24);
        assert_eq!(config.store_capacity, 10_000);
        assert!(config.retention_hours.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = TelemetryConfig::from_toml_str("").expect("parse");
        assert_eq!(config, TelemetryConfig::default());
    }

    #[test]
    fn test_camel_case_aliases() {
        let config = TelemetryConfig::from_toml_str(
            r#"
            transportUrl = "wss://telemetry.example.com/ws"
            baseReconnectDelayMs = 250
            maxReconnectAttempts = 3
            storeCapacity = 500
            "#,
        )
        .expect("parse");
        assert_eq!(config.transport_url, "wss://telemetry.example.com/ws");
        assert_eq!(config.base_reconnect_delay_ms, 250);
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.store_capacity, 500);
    }

    #[test]
    fn test_rejects_retention_shorter_than_window() {
        let err = TelemetryConfig::from_toml_str(
            r#"
            bucket_window_hours = 48
            retention_hours = 24
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_http_url_and_zero_capacity() {
        let err = TelemetryConfig::from_toml_str(r#"transport_url = "http://localhost:8080""#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = TelemetryConfig::from_toml_str("store_capacity = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "bucket_window_hours = 6").expect("write");
        writeln!(file, "retention_hours = 12").expect("write");

        let config = TelemetryConfig::load(file.path()).expect("load");
        assert_eq!(config.bucket_window_hours, 6);
        assert_eq!(config.retention(), Some(chrono::Duration::hours(12)));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = TelemetryConfig::load(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
