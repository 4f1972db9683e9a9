//! Locapay Configuration System
//!
//! This crate provides TOML-based configuration with environment variable override support.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
    pub webhook: WebhookConfig,
    pub collection: CollectionConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            gateway: GatewayConfig::default(),
            webhook: WebhookConfig::default(),
            collection: CollectionConfig::default(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection URL, e.g. "sqlite://./data/locapay.db"
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/locapay.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

/// Payment gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub base_url: String,
    /// Bearer token for the gateway API
    pub api_key: Option<String>,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://gateway.example.com".to_string(),
            api_key: None,
            connect_timeout_secs: 10,
            request_timeout_secs: 45,
        }
    }
}

/// Webhook delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// How often the dispatcher sweeps for due tasks, in milliseconds
    pub poll_interval_ms: u64,
    /// Due tasks fetched per sweep
    pub batch_size: u32,
    /// Concurrent deliveries per sweep
    pub concurrency: usize,
    pub request_timeout_secs: u64,
    pub default_max_retries: i32,
    /// How long a task may sit in PROCESSING before recovery resets it, in seconds
    pub stuck_timeout_secs: u64,
    /// Successful task records older than this are purged, in days
    pub purge_after_days: i64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            batch_size: 10,
            concurrency: 10,
            request_timeout_secs: 30,
            default_max_retries: 5,
            stuck_timeout_secs: 300,
            purge_after_days: 30,
        }
    }
}

/// Rent collection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Schedules processed per sweep
    pub batch_size: u32,
    pub default_max_retries: i32,
    /// Consumer-facing retry cadence, in days after each failed attempt
    pub retry_offsets_days: Vec<i64>,
    pub currency: String,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            default_max_retries: 3,
            retry_offsets_days: vec![3, 7, 14],
            currency: "EUR".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.is_empty() {
            return Err(ConfigError::ValidationError(
                "database.url must not be empty".to_string(),
            ));
        }
        if self.webhook.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "webhook.batch_size must be at least 1".to_string(),
            ));
        }
        if self.collection.retry_offsets_days.is_empty() {
            return Err(ConfigError::ValidationError(
                "collection.retry_offsets_days must not be empty".to_string(),
            ));
        }
        if self.collection.default_max_retries < 0 || self.webhook.default_max_retries < 0 {
            return Err(ConfigError::ValidationError(
                "max_retries must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.webhook.default_max_retries, 5);
        assert_eq!(config.collection.retry_offsets_days, vec![3, 7, 14]);
    }

    #[test]
    fn test_parse_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[database]
url = "sqlite::memory:"

[collection]
default_max_retries = 4
"#
        )
        .unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.collection.default_max_retries, 4);
        // Untouched sections keep defaults
        assert_eq!(config.webhook.batch_size, 10);
    }

    #[test]
    fn test_validation_rejects_empty_offsets() {
        let mut config = AppConfig::default();
        config.collection.retry_offsets_days.clear();
        assert!(config.validate().is_err());
    }
}
