//! Configuration management for the SkyRelay server.
//!
//! This module handles loading, validation, and conversion of server configuration
//! from TOML files and command-line arguments. The tuning tables (`pipeline`,
//! `pool`, `supervisor`, `routing`, `security`) reuse the core's own config
//! types, so any key left out of the file keeps its default.

use flight_server::config::{PipelineConfig, PoolConfig, RouterConfig, SecurityConfig, SupervisorConfig};
use flight_server::ServerConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tracing::info;

/// Log levels accepted in `logging.level`.
pub const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Errors raised while loading or checking the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Cannot serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Network and connection settings
    pub server: ServerSettings,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Routing defaults applied to clients that do not choose their own
    #[serde(default)]
    pub routing: RouterConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    /// Logging configuration settings
    pub logging: LoggingSettings,
    #[serde(default)]
    pub monitoring: MonitoringSettings,
}

/// Server-specific configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Network address to bind the server to (e.g., "0.0.0.0:14000")
    pub bind_address: String,
    /// Maximum number of concurrent client connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Idle timeout in seconds, 0 to disable
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
}

/// Logging system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

/// Periodic statistics reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSettings {
    /// Interval between stats log lines in seconds, 0 to disable
    pub stats_interval_secs: u64,
    /// Bounded wait for the server to stop on shutdown, in seconds
    pub shutdown_timeout_secs: u64,
}

pub fn default_connection_timeout() -> u64 {
    180
}

fn default_max_connections() -> usize {
    2000
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            stats_interval_secs: 60,
            shutdown_timeout_secs: 10,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                bind_address: "127.0.0.1:14000".to_string(),
                max_connections: default_max_connections(),
                connection_timeout: default_connection_timeout(),
            },
            pipeline: PipelineConfig::default(),
            pool: PoolConfig::default(),
            supervisor: SupervisorConfig::default(),
            routing: RouterConfig::default(),
            security: SecurityConfig::default(),
            logging: LoggingSettings {
                level: "info".to_string(),
                json_format: false,
            },
            monitoring: MonitoringSettings::default(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, writes the default configuration to that
    /// path and returns it.
    pub async fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            Ok(toml::from_str(&content)?)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("📝 Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Translates the file configuration into the core's [`ServerConfig`].
    pub fn to_server_config(&self) -> Result<ServerConfig, ConfigError> {
        Ok(ServerConfig {
            bind_address: self.bind_address()?,
            max_connections: self.server.max_connections,
            connection_timeout: self.server.connection_timeout,
            pipeline: self.pipeline.clone(),
            pool: self.pool.clone(),
            supervisor: self.supervisor.clone(),
            router: self.routing.clone(),
            security: self.security.clone(),
        })
    }

    fn bind_address(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .bind_address
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("Invalid bind address: {}", self.server.bind_address)))
    }

    /// Validates the configuration for consistency and correctness.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_address()?;

        if self.server.max_connections == 0 {
            return Err(invalid("server.max_connections must be greater than 0"));
        }
        if self.pipeline.queue_depth == 0 {
            return Err(invalid("pipeline.queue_depth must be greater than 0"));
        }
        if self.pipeline.max_frame_size == 0 || self.pipeline.max_frame_size > u32::MAX as usize {
            return Err(invalid("pipeline.max_frame_size must fit a 32-bit length prefix"));
        }
        if self.pool.core_threads == 0 {
            return Err(invalid("pool.core_threads must be greater than 0"));
        }
        if self.pool.max_threads < self.pool.core_threads {
            return Err(invalid("pool.max_threads must not be below pool.core_threads"));
        }
        if self.routing.default_range_nm <= 0.0 || self.routing.default_dispatch_range_nm <= 0.0 {
            return Err(invalid("routing ranges must be positive"));
        }

        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level: {}. Must be one of: {VALID_LOG_LEVELS:?}",
                &self.logging.level
            )));
        }

        Ok(())
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());

        let server_config = config.to_server_config().unwrap();
        assert_eq!(server_config.max_connections, 2000);
        assert_eq!(server_config.connection_timeout, 180);
        assert_eq!(server_config.bind_address.port(), 14000);
    }

    #[tokio::test]
    async fn test_load_from_nonexistent_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skyrelay.toml");

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:14000");
        assert!(path.exists());

        // The written file loads back to the same settings.
        let again = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(again.server.bind_address, config.server.bind_address);
        assert_eq!(again.pipeline.max_frame_size, config.pipeline.max_frame_size);
    }

    #[tokio::test]
    async fn test_load_partial_file_keeps_defaults() {
        let toml_content = r#"
[server]
bind_address = "0.0.0.0:3000"
max_connections = 50

[pipeline]
max_frame_size = 4096

[routing]
default_range_nm = 80.0

[security]
banned_ips = ["10.0.0.7"]

[logging]
level = "debug"
json_format = true
"#;
        let temp_file = NamedTempFile::new().unwrap();
        tokio::fs::write(temp_file.path(), toml_content).await.unwrap();

        let config = AppConfig::load_from_file(temp_file.path()).await.unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.max_connections, 50);
        assert_eq!(config.server.connection_timeout, 180);
        assert_eq!(config.pipeline.max_frame_size, 4096);
        assert_eq!(config.pipeline.queue_depth, PipelineConfig::default().queue_depth);
        assert_eq!(config.routing.default_range_nm, 80.0);
        assert_eq!(config.routing.default_max_aircraft, 100);
        assert!(config.logging.json_format);
        assert_eq!(config.monitoring.stats_interval_secs, 60);

        let server_config = config.to_server_config().unwrap();
        assert_eq!(server_config.security.banned_ips, vec!["10.0.0.7".parse::<std::net::IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_load_rejects_bad_toml() {
        let temp_file = NamedTempFile::new().unwrap();
        tokio::fs::write(temp_file.path(), "[server\nbind_address = 1").await.unwrap();
        assert!(matches!(
            AppConfig::load_from_file(temp_file.path()).await,
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = AppConfig::default();
        config.server.bind_address = "invalid".to_string();
        assert!(config.validate().is_err());
        assert!(config.to_server_config().is_err());

        let mut config = AppConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.pool.core_threads = 4;
        config.pool.max_threads = 2;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.pipeline.queue_depth = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.routing.default_range_nm = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_valid_log_levels() {
        let mut config = AppConfig::default();
        for level in VALID_LOG_LEVELS {
            config.logging.level = level.to_string();
            assert!(config.validate().is_ok(), "level {level} rejected");
        }
    }
}
