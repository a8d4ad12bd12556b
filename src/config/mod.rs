//! Application configuration.
//!
//! Dispatcher tuning, RPC defaults and per-domain transport settings, loaded
//! from YAML files or environment variables.

use std::collections::HashMap;

use serde::Deserialize;

use crate::transport::TransportSettings;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "courier.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "COURIER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "COURIER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "COURIER_LOG";

/// Task dispatcher settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    /// How long `publish_task` waits when the caller gives no timeout.
    pub default_timeout_ms: u64,
    /// Maximum concurrent handler callbacks per consumer.
    pub consumer_concurrency: usize,
    /// Suffix of the queue carrying status reports for a task queue.
    pub response_suffix: String,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: 15_000,
            consumer_concurrency: 4,
            response_suffix: "-response".to_string(),
        }
    }
}

/// RPC settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RpcSettings {
    pub default_timeout_secs: u64,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            default_timeout_secs: 30,
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub dispatcher: DispatcherSettings,
    pub rpc: RpcSettings,
    /// Transport per domain. Domains not listed here use the in-memory transport.
    pub domains: HashMap<String, TransportSettings>,
}

impl CourierConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `courier.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ::config::ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }

    /// Transport settings for a domain, if configured.
    pub fn domain(&self, name: &str) -> Option<&TransportSettings> {
        self.domains.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportKind;

    fn write_yaml(name: &str, body: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("{}-{}.yaml", name, uuid::Uuid::new_v4()));
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_config_default() {
        let config = CourierConfig::default();
        assert_eq!(config.dispatcher.default_timeout_ms, 15_000);
        assert_eq!(config.dispatcher.consumer_concurrency, 4);
        assert_eq!(config.dispatcher.response_suffix, "-response");
        assert_eq!(config.rpc.default_timeout_secs, 30);
        assert!(config.domains.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let path = write_yaml(
            "courier-config",
            r#"
dispatcher:
  default_timeout_ms: 2500
rpc:
  default_timeout_secs: 5
domains:
  orders:
    transport: rabbitmq
    settings:
      url: amqp://broker:5672
  billing:
    transport: memory
"#,
        );

        let config = CourierConfig::load(path.to_str()).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.dispatcher.default_timeout_ms, 2500);
        assert_eq!(config.dispatcher.consumer_concurrency, 4);
        assert_eq!(config.rpc.default_timeout_secs, 5);

        let orders = config.domain("orders").unwrap();
        assert_eq!(orders.kind, TransportKind::Amqp);
        assert_eq!(orders.option("url"), Some("amqp://broker:5672"));
        assert_eq!(config.domain("billing").unwrap().kind, TransportKind::Memory);
        assert!(config.domain("shipping").is_none());
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let result = CourierConfig::load(Some("/nonexistent/courier-missing.yaml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_transport_rejected() {
        let path = write_yaml(
            "courier-bad",
            "domains:\n  orders:\n    transport: carrier-pigeon\n",
        );
        let result = CourierConfig::load(path.to_str());
        std::fs::remove_file(&path).ok();
        assert!(result.is_err());
    }
}
