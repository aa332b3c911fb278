//! jobgraph configuration system
//!
//! # Configuration lookup
//!
//! ```text
//! Priority (high → low):
//! 1. CLI argument (--config <path>)
//! 2. Environment variable (JOBGRAPH_CONFIG)
//! 3. User-level ($XDG_CONFIG_HOME/jobgraph/config.toml or ~/.config/jobgraph/config.toml)
//! 4. Default values
//! ```
//!
//! # Usage
//!
//! ```rust
//! use jobgraph::util::config::RuntimeConfig;
//!
//! let config: RuntimeConfig = toml::from_str("[runners]\nperformance = 2").unwrap();
//! assert_eq!(config.runners.performance, 2);
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::runtime::cache::DEFAULT_CAPACITY;
use crate::runtime::scheduler::SchedulerConfig;
use crate::util::logger::LogLevel;

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "JOBGRAPH_CONFIG";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    /// Runner pool settings
    #[serde(default)]
    pub runners: RunnerConfig,
    /// Resource cache settings
    #[serde(default)]
    pub cache: CacheConfig,
    /// Log settings
    #[serde(default)]
    pub log: LogConfig,
}

/// Runner pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Runners on performance cores. `0` means one per available core.
    #[serde(default)]
    pub performance: usize,
    /// Runners on efficiency cores
    #[serde(default)]
    pub efficiency: usize,
    /// Every runner accepts every stage regardless of affinity
    #[serde(default = "default_true")]
    pub allow_all_work_on_all_runners: bool,
    /// Idle runners steal from busy ones
    #[serde(default = "default_true")]
    pub work_stealing: bool,
    /// Idle poll interval in milliseconds
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Runner thread stack size in KiB
    #[serde(default = "default_stack_size_kib")]
    pub stack_size_kib: usize,
    /// Runner thread name prefix
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
}

fn default_true() -> bool {
    true
}

fn default_idle_timeout_ms() -> u64 {
    1
}

fn default_stack_size_kib() -> usize {
    2048
}

fn default_thread_name_prefix() -> String {
    "jobgraph-runner".to_string()
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            performance: 0,
            efficiency: 0,
            allow_all_work_on_all_runners: true,
            work_stealing: true,
            idle_timeout_ms: 1,
            stack_size_kib: 2048,
            thread_name_prefix: "jobgraph-runner".to_string(),
        }
    }
}

impl From<&RunnerConfig> for SchedulerConfig {
    fn from(config: &RunnerConfig) -> Self {
        let defaults = SchedulerConfig::default();
        let mut performance = config.performance;
        if performance == 0 && config.efficiency == 0 {
            performance = defaults.performance_runners;
        }
        SchedulerConfig {
            performance_runners: performance,
            efficiency_runners: config.efficiency,
            allow_all_work_on_all_runners: config.allow_all_work_on_all_runners,
            stack_size: config.stack_size_kib.max(64) * 1024,
            use_work_stealing: config.work_stealing,
            idle_timeout: Duration::from_millis(config.idle_timeout_ms.max(1)),
            thread_name_prefix: config.thread_name_prefix.clone(),
        }
    }
}

/// Resource cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of simultaneously registered resources
    #[serde(default = "default_cache_capacity")]
    pub capacity: u32,
}

fn default_cache_capacity() -> u32 {
    DEFAULT_CAPACITY
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Log configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LogConfig {
    /// Default level
    #[serde(default)]
    pub level: LogLevel,
    /// `RUST_LOG`-style directives, e.g. `jobgraph::runtime::cache=trace`
    #[serde(default)]
    pub filter: Option<String>,
}

/// Get the user config directory
pub fn get_config_dir() -> Option<PathBuf> {
    // Try XDG config directory on Unix
    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config).join("jobgraph"));
    }

    // Fallback to ~/.config/jobgraph
    if let Ok(home) = std::env::var("HOME") {
        return Some(PathBuf::from(home).join(".config").join("jobgraph"));
    }

    // On Windows, try %APPDATA%
    if let Ok(appdata) = std::env::var("APPDATA") {
        return Some(PathBuf::from(appdata).join("jobgraph"));
    }

    None
}

/// Get the user config file path (~/.config/jobgraph/config.toml)
pub fn get_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.toml"))
}

/// Pick the config file to read, if any.
///
/// An explicit path or `JOBGRAPH_CONFIG` is returned even if it does not
/// exist, so that loading it reports the mistake. The user-level file is
/// only returned when present.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    get_config_path().filter(|p| p.exists())
}

/// Load configuration following the lookup order
pub fn load_config(explicit: Option<&Path>) -> Result<RuntimeConfig, ConfigError> {
    match resolve_config_path(explicit) {
        Some(path) => load_config_file(&path),
        None => Ok(RuntimeConfig::default()),
    }
}

/// Load configuration from a specific file
pub fn load_config_file(path: &Path) -> Result<RuntimeConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Save configuration to a specific file, creating parent directories
pub fn save_config_file(
    config: &RuntimeConfig,
    path: &Path,
) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let content = to_toml(config)?;
    fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Render configuration as TOML
pub fn to_toml(config: &RuntimeConfig) -> Result<String, ConfigError> {
    toml::to_string_pretty(config).map_err(ConfigError::Serialize)
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Config parse error in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
