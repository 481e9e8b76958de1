//! Configuration loading, validation, and management for tokenloom.
//!
//! Loads configuration from `~/.tokenloom/config.toml` with environment
//! variable overrides. Validates all settings at startup. The engine itself
//! only ever sees an [`EngineConfig`] value; it never reads files or env.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.tokenloom/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Budget used by the CLI when `--budget` is not given
    #[serde(default = "default_budget")]
    pub default_budget: u64,

    /// Render engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Character-heuristic measurer configuration
    #[serde(default)]
    pub measurer: MeasurerConfig,
}

fn default_budget() -> u64 {
    4096
}

/// Settings that shape how a render behaves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of measured sizes kept in the process-wide cache.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Whether eviction removes single units or whole uniform subtrees.
    #[serde(default)]
    pub eviction: EvictionGranularity,

    /// What to do when the measurer fails for some content.
    #[serde(default)]
    pub measurement_failure: MeasurementFailurePolicy,

    /// What to do when a component's prepare or expand fails.
    #[serde(default)]
    pub component_failure: ComponentFailurePolicy,

    /// Upper bound on expansion levels before giving up on a fix-point.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Joins adjacent leaf fragments that share an owner and role.
    #[serde(default = "default_leaf_separator")]
    pub leaf_separator: String,
}

fn default_cache_capacity() -> usize {
    2048
}
fn default_max_depth() -> usize {
    64
}
fn default_leaf_separator() -> String {
    "\n".into()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_cache_capacity(),
            eviction: EvictionGranularity::default(),
            measurement_failure: MeasurementFailurePolicy::default(),
            component_failure: ComponentFailurePolicy::default(),
            max_depth: default_max_depth(),
            leaf_separator: default_leaf_separator(),
        }
    }
}

/// Eviction granularity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionGranularity {
    /// Every leaf unit is evicted on its own.
    #[default]
    Unit,
    /// A container whose whole subtree shares one priority is evicted all-or-nothing.
    UniformSubtree,
}

/// Measurement failure policy, applied uniformly to every piece of content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementFailurePolicy {
    /// Fail the whole request.
    #[default]
    Propagate,
    /// Give the content maximal size so it is evicted before anything else.
    TreatAsMaximal,
}

/// Isolation granularity for component failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentFailurePolicy {
    /// Fail the whole request.
    #[default]
    Abort,
    /// Degrade the failing node to an empty subtree and keep going.
    IsolateSubtree,
}

/// Settings for the built-in character heuristic measurer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurerConfig {
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,

    #[serde(default = "default_per_message_overhead")]
    pub per_message_overhead: u64,
}

fn default_chars_per_token() -> usize {
    4
}
fn default_per_message_overhead() -> u64 {
    4
}

impl Default for MeasurerConfig {
    fn default() -> Self {
        Self {
            chars_per_token: default_chars_per_token(),
            per_message_overhead: default_per_message_overhead(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default location.
    ///
    /// Also checks environment variables:
    /// - `TOKENLOOM_BUDGET` overrides `default_budget`
    /// - `TOKENLOOM_CACHE_CAPACITY` overrides `engine.cache_capacity`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if let Ok(budget) = std::env::var("TOKENLOOM_BUDGET") {
            config.default_budget = budget.parse().map_err(|_| {
                ConfigError::ValidationError(format!("TOKENLOOM_BUDGET is not a number: {budget}"))
            })?;
        }

        if let Ok(capacity) = std::env::var("TOKENLOOM_CACHE_CAPACITY") {
            config.engine.cache_capacity = capacity.parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "TOKENLOOM_CACHE_CAPACITY is not a number: {capacity}"
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".tokenloom")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.cache_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "engine.cache_capacity must be greater than 0".into(),
            ));
        }

        if self.engine.max_depth == 0 {
            return Err(ConfigError::ValidationError(
                "engine.max_depth must be greater than 0".into(),
            ));
        }

        if self.measurer.chars_per_token == 0 {
            return Err(ConfigError::ValidationError(
                "measurer.chars_per_token must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for the `config` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_budget: default_budget(),
            engine: EngineConfig::default(),
            measurer: MeasurerConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
