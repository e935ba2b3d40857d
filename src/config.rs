//! Application configuration.
//!
//! Loaded from YAML files or environment variables and handed by
//! reference to the components that need it.

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration loading failed: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "EPIQUERY_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "EPIQUERY";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "EPIQUERY_LOG";

/// Credential substituted when a command's `user_key` parameter is
/// not supplied.
pub const ANONYMOUS_USER_KEY: &str = "anonymous_key";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote engine configuration.
    pub engine: EngineConfig,
}

/// Connection settings for the remote region engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine endpoint URL.
    pub url: String,
    /// Default credential for calls without an explicit key.
    pub user_key: String,
    /// Lower bound of the randomized poll interval, in milliseconds.
    pub poll_min_ms: u64,
    /// Upper bound of the randomized poll interval, in milliseconds.
    pub poll_max_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:31415".to_string(),
            user_key: ANONYMOUS_USER_KEY.to_string(),
            poll_min_ms: 0,
            poll_max_ms: 500,
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.engine.user_key, ANONYMOUS_USER_KEY);
        assert_eq!(config.engine.poll_max_ms, 500);
    }

    #[test]
    fn test_config_for_test() {
        let config = Config::for_test();
        assert!(config.engine.url.starts_with("http://"));
    }
}
