//! Configuration management for Floodgate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use crate::error::{FloodgateError, Result};

/// Main configuration for the Floodgate service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            rate_limiting: RateLimitingConfig::default(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:8080".parse().unwrap()
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite connection string for the counter store
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite://rate_limits.db".to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Master switch; when false, requests pass through untouched
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Skip limiting for loopback clients (developer convenience)
    #[serde(default)]
    pub skip_loopback: bool,

    /// Window length in seconds, shared by all tiers
    #[serde(default = "default_window_duration")]
    pub window_duration_secs: u64,

    /// How often the expired-row purge runs, in seconds
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,

    /// Ceiling for broad application routes
    #[serde(default = "default_general_limits")]
    pub general: TierLimits,

    /// Ceiling for authentication routes
    #[serde(default = "default_strict_limits")]
    pub strict: TierLimits,

    /// Ceiling for machine-readable API routes
    #[serde(default = "default_api_limits")]
    pub api: TierLimits,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            skip_loopback: false,
            window_duration_secs: default_window_duration(),
            purge_interval_secs: default_purge_interval(),
            general: default_general_limits(),
            strict: default_strict_limits(),
            api: default_api_limits(),
        }
    }
}

/// Per-tier ceiling and block duration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierLimits {
    /// Maximum points consumable within one window
    pub points: u64,

    /// How long a violator stays blocked once the ceiling is exceeded, in seconds
    pub block_duration_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_window_duration() -> u64 {
    60
}

fn default_purge_interval() -> u64 {
    3600
}

fn default_general_limits() -> TierLimits {
    TierLimits {
        points: 100,
        block_duration_secs: 60,
    }
}

fn default_strict_limits() -> TierLimits {
    TierLimits {
        points: 5,
        block_duration_secs: 120,
    }
}

fn default_api_limits() -> TierLimits {
    TierLimits {
        points: 60,
        block_duration_secs: 60,
    }
}

impl AppConfig {
    /// Load configuration: file if given, then environment overrides, then validation.
    ///
    /// Any invalid value is fatal; the service refuses to start with an
    /// undefined policy.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Apply environment variable overrides on top of the current values.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(enabled) = env_override("RATE_LIMIT_ENABLED")? {
            self.rate_limiting.enabled = enabled;
        }
        if let Some(points) = env_override("RATE_LIMIT_GENERAL_POINTS")? {
            self.rate_limiting.general.points = points;
        }
        if let Some(points) = env_override("RATE_LIMIT_STRICT_POINTS")? {
            self.rate_limiting.strict.points = points;
        }
        if let Some(points) = env_override("RATE_LIMIT_API_POINTS")? {
            self.rate_limiting.api.points = points;
        }
        if let Some(secs) = env_override("RATE_LIMIT_DURATION")? {
            self.rate_limiting.window_duration_secs = secs;
        }
        if let Some(url) = env_override::<String>("RATE_LIMIT_DATABASE_URL")? {
            self.storage.database_url = url;
        }
        Ok(())
    }

    /// Reject configurations that would leave the limiter policy undefined.
    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limiting;
        if rl.window_duration_secs == 0 {
            return Err(FloodgateError::Config(
                "window duration must be at least one second".to_string(),
            ));
        }
        for (tier, limits) in [
            ("general", &rl.general),
            ("strict", &rl.strict),
            ("api", &rl.api),
        ] {
            if limits.points == 0 {
                return Err(FloodgateError::Config(format!(
                    "{} tier points limit must be at least 1",
                    tier
                )));
            }
        }
        if self.storage.database_url.is_empty() {
            return Err(FloodgateError::Config(
                "storage database URL must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_override<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| FloodgateError::Config(format!("Invalid value for {}: {}", name, e))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(FloodgateError::Config(format!(
            "Failed to read {}: {}",
            name, e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tier_policies() {
        let config = AppConfig::default();
        let rl = &config.rate_limiting;

        assert!(rl.enabled);
        assert!(!rl.skip_loopback);
        assert_eq!(rl.window_duration_secs, 60);
        assert_eq!(rl.general.points, 100);
        assert_eq!(rl.general.block_duration_secs, 60);
        assert_eq!(rl.strict.points, 5);
        assert_eq!(rl.strict.block_duration_secs, 120);
        assert_eq!(rl.api.points, 60);
        assert_eq!(rl.api.block_duration_secs, 60);
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
server:
  listen_addr: "0.0.0.0:9000"
rate_limiting:
  window_duration_secs: 30
  strict:
    points: 3
    block_duration_secs: 90
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.server.listen_addr, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.rate_limiting.window_duration_secs, 30);
        assert_eq!(config.rate_limiting.strict.points, 3);
        assert_eq!(config.rate_limiting.strict.block_duration_secs, 90);
        // Untouched tiers keep their defaults
        assert_eq!(config.rate_limiting.general.points, 100);
        assert_eq!(config.rate_limiting.api.points, 60);
    }

    #[test]
    fn test_env_overrides() {
        // Single test so parallel test threads never race on the variables
        std::env::set_var("RATE_LIMIT_ENABLED", "false");
        std::env::set_var("RATE_LIMIT_STRICT_POINTS", "3");
        std::env::set_var("RATE_LIMIT_DURATION", "120");
        std::env::set_var("RATE_LIMIT_DATABASE_URL", "sqlite::memory:");

        let mut config = AppConfig::default();
        config.apply_env().unwrap();

        assert!(!config.rate_limiting.enabled);
        assert_eq!(config.rate_limiting.strict.points, 3);
        assert_eq!(config.rate_limiting.window_duration_secs, 120);
        assert_eq!(config.storage.database_url, "sqlite::memory:");

        std::env::set_var("RATE_LIMIT_DURATION", "not-a-number");
        let mut config = AppConfig::default();
        assert!(config.apply_env().is_err());

        std::env::remove_var("RATE_LIMIT_ENABLED");
        std::env::remove_var("RATE_LIMIT_STRICT_POINTS");
        std::env::remove_var("RATE_LIMIT_DURATION");
        std::env::remove_var("RATE_LIMIT_DATABASE_URL");
    }

    #[test]
    fn test_validate_rejects_zero_points() {
        let mut config = AppConfig::default();
        config.rate_limiting.strict.points = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let mut config = AppConfig::default();
        config.rate_limiting.window_duration_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(AppConfig::default().validate().is_ok());
    }
}
