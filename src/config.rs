//! Runtime configuration.
//!
//! Hierarchical TOML configuration with environment variable overrides.
//! Precedence, highest first: environment variables, configuration file,
//! built-in defaults.

use crate::error::ConfigError;
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DashvarConfig {
    /// Resolution engine and orchestrator tuning
    #[serde(default)]
    pub engine: EngineConfig,

    /// Local panel cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Engine and orchestrator tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Debounce applied before each panel load run, in milliseconds
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Capacity of the readiness event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_channel_capacity: usize,
}

fn default_debounce_ms() -> u64 {
    50
}

fn default_event_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            event_channel_capacity: default_event_capacity(),
        }
    }
}

impl EngineConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Local panel cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Disable to skip all cache reads and writes
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directory holding the cache database
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
}

fn default_true() -> bool {
    true
}

fn default_cache_path() -> PathBuf {
    PathBuf::from(".dashvar/cache")
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            path: default_cache_path(),
        }
    }
}

impl DashvarConfig {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: DashvarConfig = toml::from_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for callers without a file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = DashvarConfig::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("DASHVAR_DEBOUNCE_MS") {
            if let Ok(parsed) = value.parse() {
                self.engine.debounce_ms = parsed;
            }
        }
        if let Ok(value) = std::env::var("DASHVAR_CACHE_DIR") {
            self.cache.path = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("DASHVAR_CACHE_ENABLED") {
            if let Ok(parsed) = value.parse() {
                self.cache.enabled = parsed;
            }
        }
        if let Ok(value) = std::env::var("DASHVAR_LOG") {
            self.logging.level = value;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.event_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "engine.event_channel_capacity must be greater than zero".to_string(),
            ));
        }
        if self.cache.enabled && self.cache.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "cache.path must not be empty when the cache is enabled".to_string(),
            ));
        }
        Ok(())
    }
}
