//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "locapay.toml",
    "./config/config.toml",
    "./config/locapay.toml",
    "/etc/locapay/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        // Start with defaults
        let mut config = AppConfig::default();

        // Try to load from file
        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        // Apply environment variable overrides
        self.apply_env_overrides(&mut config);

        config.validate()?;
        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        // Check explicit path first
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        // Check LOCAPAY_CONFIG env var
        if let Ok(path) = env::var("LOCAPAY_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        // Search standard paths
        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // Database
        if let Ok(val) = env::var("LOCAPAY_DATABASE_URL") {
            config.database.url = val;
        }
        if let Ok(val) = env::var("LOCAPAY_DATABASE_MAX_CONNECTIONS") {
            if let Ok(n) = val.parse() {
                config.database.max_connections = n;
            }
        }

        // Gateway
        if let Ok(val) = env::var("LOCAPAY_GATEWAY_URL") {
            config.gateway.base_url = val;
        }
        if let Ok(val) = env::var("LOCAPAY_GATEWAY_API_KEY") {
            config.gateway.api_key = Some(val);
        }

        // Webhooks
        if let Ok(val) = env::var("LOCAPAY_WEBHOOK_POLL_INTERVAL_MS") {
            if let Ok(ms) = val.parse() {
                config.webhook.poll_interval_ms = ms;
            }
        }
        if let Ok(val) = env::var("LOCAPAY_WEBHOOK_BATCH_SIZE") {
            if let Ok(n) = val.parse() {
                config.webhook.batch_size = n;
            }
        }
        if let Ok(val) = env::var("LOCAPAY_WEBHOOK_MAX_RETRIES") {
            if let Ok(n) = val.parse() {
                config.webhook.default_max_retries = n;
            }
        }

        // Collection
        if let Ok(val) = env::var("LOCAPAY_COLLECTION_BATCH_SIZE") {
            if let Ok(n) = val.parse() {
                config.collection.batch_size = n;
            }
        }
        if let Ok(val) = env::var("LOCAPAY_COLLECTION_MAX_RETRIES") {
            if let Ok(n) = val.parse() {
                config.collection.default_max_retries = n;
            }
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_without_file_uses_defaults() {
        let loader = ConfigLoader::with_path("/nonexistent/config.toml");
        let config = loader.load().unwrap();
        assert_eq!(config.webhook.batch_size, AppConfig::default().webhook.batch_size);
    }
}
