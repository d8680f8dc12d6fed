//! Configuration models for stagepoint.
//!
//! All I^R (resolvable ignorance) is parameterized here.
//! The user resolves these unknowns at runtime via config file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for stagepoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Where checkpoints live
    #[serde(default)]
    pub storage: StorageConfig,

    /// Checkpoint store behaviour
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Assembler generation settings
    #[serde(default)]
    pub assembler: AssemblerConfig,
}

/// What to do when a checkpoint path already holds data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    /// Replace existing contents (default)
    #[default]
    Overwrite,
    /// Refuse to write if the path exists
    FailIfExists,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for relative checkpoint paths.
    /// Values can contain ${ENV_VAR} for environment variable expansion
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Policy used by `CheckpointStore::path`
    #[serde(default)]
    pub default_policy: WritePolicy,
}

fn default_root() -> PathBuf {
    PathBuf::from("checkpoints")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            default_policy: WritePolicy::default(),
        }
    }
}

impl StorageConfig {
    /// Root directory with `${VAR}` placeholders expanded.
    pub fn resolved_root(&self) -> PathBuf {
        PathBuf::from(expand_env_vars(&self.root.to_string_lossy()))
    }
}

/// Checkpoint store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Directory (relative to storage root) for transaction intent files
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Write a `<path>.meta.json` sidecar next to each checkpoint
    #[serde(default = "default_true")]
    pub write_manifest: bool,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".stagepoint")
}

fn default_true() -> bool {
    true
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            write_manifest: true,
        }
    }
}

/// Verbosity at which generated assembler source is logged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceLogLevel {
    Off,
    #[default]
    Debug,
    Trace,
}

/// Assembler generator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblerConfig {
    /// Maximum number of generated assemblers kept in the cache
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Level at which generated source text is logged
    #[serde(default)]
    pub source_log: SourceLogLevel,
}

fn default_cache_capacity() -> usize {
    256
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_cache_capacity(),
            source_log: SourceLogLevel::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// B_i(file exists) → Result
    /// B_i(file is valid TOML) → Result
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that parse but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.assembler.cache_capacity == 0 {
            return Err(ConfigError::Invalid(
                "assembler.cache_capacity must be at least 1".to_string(),
            ));
        }
        if self.checkpoint.state_dir.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "checkpoint.state_dir must be relative to the storage root, got {}",
                self.checkpoint.state_dir.display()
            )));
        }
        Ok(())
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex");

    for cap in re.captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Configuration errors.
///
/// Epistemic origin:
/// - B_i falsified: File not found, parse error
/// - I^B materialized: Values that parse but cannot be used
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
