// Configuration File Support
//
// TOML configuration for the admission daemon with environment variable
// overrides. The file path comes from ADMISSION_CONFIG, falling back to
// ./admission.toml; a missing file means defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::rate_limit::config::{RateLimitConfig, DEFAULT_ROLE};

/// Default config file name, relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "admission.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// HTTP server configuration
    pub server: ServerConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,

    /// Rules, roles and admission behaviour
    pub admission: RateLimitConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub bind: String,

    /// Take the client IP from the first X-Forwarded-For entry
    pub trust_forwarded_for: bool,

    /// Role assumed when a trusted identity header carries no role
    pub default_role: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            trust_forwarded_for: false,
            default_role: DEFAULT_ROLE.to_string(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether to serve /metrics
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Load configuration from ADMISSION_CONFIG or ./admission.toml
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed or
    /// fails validation. A missing file yields the defaults.
    pub fn load() -> Result<Self> {
        Self::load_from_path(Self::config_path())
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed or
    /// fails validation.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file location
    pub fn config_path() -> PathBuf {
        std::env::var("ADMISSION_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - ADMISSION_LOG_LEVEL
    /// - ADMISSION_LOG_FORMAT
    /// - ADMISSION_BIND
    /// - ADMISSION_METRICS_ENABLED
    /// - ADMISSION_ENABLED, ADMISSION_FAILURE_POLICY, ADMISSION_SWEEP_INTERVAL_SECS
    pub fn apply_env_overrides(mut self) -> Self {
        // Logging overrides
        if let Ok(level) = std::env::var("ADMISSION_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("ADMISSION_LOG_FORMAT") {
            self.logging.format = format;
        }

        // Server overrides
        if let Ok(bind) = std::env::var("ADMISSION_BIND") {
            if bind.parse::<SocketAddr>().is_ok() {
                self.server.bind = bind;
            }
        }

        // Metrics overrides
        if let Ok(enabled) = std::env::var("ADMISSION_METRICS_ENABLED") {
            self.metrics.enabled = enabled.parse().unwrap_or(self.metrics.enabled);
        }

        self.admission = self.admission.apply_env_overrides();
        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        // Validate logging level
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!("Invalid log level: {}. Must be one of: trace, debug, info, warn, error", self.logging.level),
        }

        // Validate logging format
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!("Invalid log format: {}. Must be one of: json, pretty, compact", self.logging.format),
        }

        self.bind_addr()?;

        if !self.admission.roles.contains_key(&self.server.default_role) {
            anyhow::bail!("Default role '{}' has no quota limits configured", self.server.default_role);
        }

        self.admission
            .validate()
            .context("Invalid [admission] section")?;

        Ok(())
    }

    /// Parsed listen address
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.server.bind))
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging.level.to_lowercase().parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::config::{FailurePolicy, RuleScope};
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Tests touching ADMISSION_* variables must not interleave
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_VARS: &[&str] = &[
        "ADMISSION_LOG_LEVEL",
        "ADMISSION_LOG_FORMAT",
        "ADMISSION_BIND",
        "ADMISSION_METRICS_ENABLED",
        "ADMISSION_ENABLED",
        "ADMISSION_FAILURE_POLICY",
        "ADMISSION_SWEEP_INTERVAL_SECS",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "compact");
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert!(!config.server.trust_forwarded_for);
        assert!(config.metrics.enabled);
        assert!(config.admission.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_invalid_log_format() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_invalid_bind() {
        let mut config = Config::default();
        config.server.bind = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_unknown_default_role() {
        let mut config = Config::default();
        config.server.default_role = "gold".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_rejects_bad_rules() {
        let mut config = Config::default();
        config.admission.rules.pop();
        let err = config.validate().unwrap_err();
        assert!(format!("{:#}", err).contains("catch-all"));
    }

    #[test]
    fn test_load_from_nonexistent_file() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().with_extension("nonexistent");
        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_valid_toml_config() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        let temp_file = NamedTempFile::new().unwrap();
        let toml_content = r#"
[logging]
level = "debug"
format = "json"

[server]
bind = "0.0.0.0:9000"
trust_forwarded_for = true

[admission]
failure_policy = "fail_closed"

[[admission.rules]]
pattern = "/login"
methods = ["POST"]
max_requests = 3
window_seconds = 30

[[admission.rules]]
pattern = "/*"
max_requests = 50
window_seconds = 60

[admission.roles.free]
request_limit = 200
expensive_call_limit = 20

[[admission.expensive_endpoints]]
pattern = "/reports/*"
methods = ["POST"]
"#;

        fs::write(temp_file.path(), toml_content).unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert!(config.server.trust_forwarded_for);
        assert_eq!(config.admission.failure_policy, FailurePolicy::FailClosed);
        assert_eq!(config.admission.rules.len(), 2);
        assert_eq!(config.admission.rules[0].scope, RuleScope::PerIp);
        assert_eq!(config.admission.rules[0].methods, Some(vec!["POST".to_string()]));
        assert_eq!(config.admission.roles["free"].request_limit, 200);
        assert_eq!(config.admission.roles.len(), 1);
        assert_eq!(config.admission.expensive_endpoints.len(), 1);
    }

    #[test]
    fn test_load_invalid_toml_config() {
        let temp_file = NamedTempFile::new().unwrap();
        let toml_content = r#"
[logging
level = "debug"
"#; // Invalid TOML

        fs::write(temp_file.path(), toml_content).unwrap();

        let config = Config::load_from_path(temp_file.path());
        assert!(config.is_err());
    }

    #[test]
    fn test_env_overrides() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        std::env::set_var("ADMISSION_LOG_LEVEL", "debug");
        std::env::set_var("ADMISSION_LOG_FORMAT", "json");
        std::env::set_var("ADMISSION_BIND", "0.0.0.0:7000");
        std::env::set_var("ADMISSION_METRICS_ENABLED", "false");
        std::env::set_var("ADMISSION_FAILURE_POLICY", "fail_closed");

        let config = Config::default().apply_env_overrides();
        clear_env();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.server.bind, "0.0.0.0:7000");
        assert!(!config.metrics.enabled);
        assert_eq!(config.admission.failure_policy, FailurePolicy::FailClosed);
    }

    #[test]
    fn test_env_overrides_invalid_values() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        std::env::set_var("ADMISSION_BIND", "nowhere");
        std::env::set_var("ADMISSION_ENABLED", "maybe");

        let config = Config::default().apply_env_overrides();
        clear_env();

        // Should keep defaults for invalid values
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert!(config.admission.enabled);
    }

    #[test]
    fn test_log_level_parsing() {
        let mut config = Config::default();
        config.logging.level = "warn".to_string();
        assert_eq!(config.log_level().unwrap(), tracing::Level::WARN);
    }

    #[test]
    fn test_log_level_parsing_invalid() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.log_level().is_err());
    }

    #[test]
    fn test_config_partial_toml() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        let temp_file = NamedTempFile::new().unwrap();
        fs::write(temp_file.path(), "[metrics]\nenabled = false\n").unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert!(!config.metrics.enabled);
        assert_eq!(config.logging, LoggingConfig::default());
        assert_eq!(config.admission, RateLimitConfig::default());
    }
}
