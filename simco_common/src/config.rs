//! Configuration data model and loading.
//!
//! The coordinator and its module set are described by a persisted JSON
//! document mapping onto [`CoordinatorConfig`]. Loading goes through the
//! [`ConfigLoader`] trait so the coordinator can be constructed against a
//! file-backed loader in production and an in-memory one in tests.
//!
//! All configs are immutable once a run starts: the coordinator takes a
//! snapshot at Setup and never re-reads them mid-scenario.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::{DEFAULT_CMD_TIMEOUT_MS, DEFAULT_MAX_FORCING_TIMEOUT_MS, DEFAULT_STEP_TIMEOUT_MS};

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at the specified path.
    #[error("configuration file not found: {0}")]
    FileNotFound(PathBuf),

    /// JSON parsing failed.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Scheduling policy governing module firing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationMode {
    /// All modules share one global clock advanced by the gcd of periods.
    Sync,
    /// Event-driven schedule; each module runs on its own period with a
    /// modeled response latency.
    Async,
    /// Event-driven schedule with execution order controlled by a
    /// priority key at equal time points.
    Priority,
    /// Named groups stay synchronous with each other, members inside a
    /// group run asynchronously.
    IntergroupSync,
    /// Members of a group stay synchronous with each other, distinct
    /// groups run asynchronously.
    IntragroupSync,
}

/// Category tag of a module, used for status reporting and teardown
/// ordering decisions. No scheduling semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModuleCategory {
    #[default]
    Unspecified,
    Planning,
    Control,
    Perception,
    VehicleDynamics,
    Traffic,
    Grading,
    Tool,
}

/// Per-module command and step timeouts [ms]. Value type, compared by
/// equality when deciding whether an existing connection can be kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Timeout for connect/init/reset/stop exchanges.
    #[serde(default = "default_cmd_timeout")]
    pub cmd_timeout_ms: u32,
    /// Timeout for one step reply. 0 means no step timeout (and no
    /// heartbeat-based liveness for the module).
    #[serde(default = "default_step_timeout")]
    pub step_timeout_ms: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            cmd_timeout_ms: DEFAULT_CMD_TIMEOUT_MS,
            step_timeout_ms: DEFAULT_STEP_TIMEOUT_MS,
        }
    }
}

fn default_cmd_timeout() -> u32 {
    DEFAULT_CMD_TIMEOUT_MS
}

fn default_step_timeout() -> u32 {
    DEFAULT_STEP_TIMEOUT_MS
}

fn default_true() -> bool {
    true
}

/// Identity and launch recipe for one module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Unique module name. Doubles as the registration key.
    pub name: String,

    /// Path to the module executable.
    pub bin_path: PathBuf,

    /// Additional launch arguments.
    #[serde(default)]
    pub bin_args: Vec<String>,

    /// Key/value arguments forwarded in the Init request. Ordered map so
    /// the reuse comparison is deterministic.
    #[serde(default)]
    pub init_args: BTreeMap<String, String>,

    /// Execution period [ms]. Must be > 0.
    pub exec_period_ms: u32,

    /// Response-time budget [ms]. 0 means synchronous (treated as equal
    /// to the period). Under [`CoordinationMode::Priority`] this value
    /// doubles as the priority key at equal time points.
    #[serde(default)]
    pub response_time_ms: u32,

    /// Connect/step timeouts.
    #[serde(default)]
    pub conn_args: ConnectionConfig,

    /// Whether the coordinator launches the process itself. When false
    /// the module is expected to be launched manually and to register
    /// with the registry on its own.
    #[serde(default = "default_true")]
    pub auto_launch: bool,

    #[serde(default)]
    pub category: ModuleCategory,

    /// Non-zero marks a duplicate/what-if instance running alongside the
    /// primary without being the canonical data source.
    #[serde(default)]
    pub shadow_id: i32,

    #[serde(default)]
    pub priority: u16,

    /// Scheduling group name; empty for ungrouped modules. Only the two
    /// group-sync coordination modes consult this.
    #[serde(default)]
    pub group: String,
}

/// Top-level coordinator configuration. Owns every [`ModuleConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub coord_mode: CoordinationMode,

    #[serde(default)]
    pub module_configs: Vec<ModuleConfig>,

    /// Module gating scenario start: until it has fired once, only it
    /// is scheduled. Ignored by the group-sync coordination modes.
    #[serde(default)]
    pub trigger_module: Option<String>,

    /// Stop the scenario automatically when a step returns an error.
    #[serde(default = "default_true")]
    pub auto_stop: bool,

    /// Upper bound a step reply may be forced to wait past the module's
    /// own step timeout before the step is failed [ms].
    #[serde(default = "default_max_forcing_timeout")]
    pub max_forcing_timeout_ms: u32,

    /// Directory for per-module log files. Defaults to the working
    /// directory when unset.
    #[serde(default)]
    pub module_log_directory: Option<PathBuf>,

    /// Overwrite the module log file on relaunch instead of creating a
    /// timestamped one.
    #[serde(default)]
    pub override_module_log: bool,
}

fn default_max_forcing_timeout() -> u32 {
    DEFAULT_MAX_FORCING_TIMEOUT_MS
}

impl CoordinatorConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - a module name is empty or duplicated
    /// - an execution period is 0
    /// - an auto-launch module has an empty binary path
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for m in &self.module_configs {
            if m.name.is_empty() {
                return Err(ConfigError::ValidationError("module name cannot be empty".into()));
            }
            if !seen.insert(m.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate module name: {}",
                    m.name
                )));
            }
            if m.exec_period_ms == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{} module exec period cannot be 0",
                    m.name
                )));
            }
            if m.auto_launch && m.bin_path.as_os_str().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "auto-launch module {} has no binary path",
                    m.name
                )));
            }
        }
        if let Some(trigger) = &self.trigger_module {
            if !seen.contains(trigger.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "trigger module {trigger} is not a configured module"
                )));
            }
        }
        Ok(())
    }
}

/// Loads a [`CoordinatorConfig`] from its persisted form.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the backing store is absent
/// - Returns `ConfigError::ParseError` on malformed content
/// - Returns `ConfigError::ValidationError` if semantic validation fails
pub trait ConfigLoader: Send {
    fn load(&self) -> Result<CoordinatorConfig, ConfigError>;
}

/// File-backed loader for the persisted JSON configuration document.
#[derive(Debug, Clone)]
pub struct JsonConfigLoader {
    path: PathBuf,
}

impl JsonConfigLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigLoader for JsonConfigLoader {
    fn load(&self) -> Result<CoordinatorConfig, ConfigError> {
        if !self.path.exists() {
            return Err(ConfigError::FileNotFound(self.path.clone()));
        }
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        let config: CoordinatorConfig =
            serde_json::from_str(&raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
