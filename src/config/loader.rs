//! Configuration Loader
//!
//! Environment-aware configuration loading. Discovers the base and
//! environment-specific TOML files, layers environment variable overrides on
//! top and validates the merged result.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::error::{ConfigResult, ConfigurationError};
use super::ConductorConfig;

const CONFIG_FILE_STEM: &str = "conductor";
const ENV_PREFIX: &str = "CONDUCTOR";
const ENV_SEPARATOR: &str = "__";

/// Loaded, validated configuration plus where it came from
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: ConductorConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment
    /// This is useful for testing without modifying global environment variables
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(|| PathBuf::from("config"));

        debug!(
            environment = environment,
            config_directory = %config_directory.display(),
            "Loading configuration"
        );

        let config = Self::load_and_merge_config(&config_directory, environment)?;
        config.validate()?;

        info!(
            environment = environment,
            max_concurrent_tasks = config.execution.max_concurrent_tasks,
            max_attempts = config.retry.max_attempts,
            revision_policy = ?config.execution.revision_policy,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an already-built configuration, validating it first
    pub fn from_config(config: ConductorConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: Self::detect_environment(),
            config_directory: PathBuf::from("config"),
        }))
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    fn load_and_merge_config(
        config_directory: &Path,
        environment: &str,
    ) -> ConfigResult<ConductorConfig> {
        let base_file = config_directory.join(format!("{CONFIG_FILE_STEM}.toml"));
        let env_file = config_directory.join(format!("{CONFIG_FILE_STEM}.{environment}.toml"));

        let defaults = config::Config::try_from(&ConductorConfig::default())?;

        let merged = config::Config::builder()
            .add_source(defaults)
            .add_source(Self::optional_toml(&base_file)?)
            .add_source(Self::optional_toml(&env_file)?)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?;

        merged.try_deserialize().map_err(ConfigurationError::from)
    }

    fn optional_toml(
        path: &Path,
    ) -> ConfigResult<config::File<config::FileSourceFile, config::FileFormat>> {
        let name = path.to_str().ok_or_else(|| {
            ConfigurationError::invalid_value(
                "config_directory",
                path.display(),
                "configuration path must be valid UTF-8",
            )
        })?;

        if path.exists() {
            debug!(path = name, "Merging configuration file");
        }

        Ok(config::File::new(name, config::FileFormat::Toml).required(false))
    }

    /// Detect environment from environment variables
    pub fn detect_environment() -> String {
        env::var("CONDUCTOR_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }
}
