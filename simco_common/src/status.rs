//! Commands, error codes and the per-command status records returned by
//! the coordinator.
//!
//! Every command execution produces one [`CommandStatus`]. Per-module
//! outcomes are aggregated into the overall [`CmdErrorCode`] via a strict
//! worst-code-wins ordering: error codes are declared in ascending
//! severity and [`CommandStatus::apply_err_code`] keeps the maximum seen.

use serde::{Deserialize, Serialize};

/// Orchestration commands accepted by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    UnSetup,
    Setup,
    Reset,
    Step,
    Run,
    Pause,
    Stop,
}

impl Command {
    /// Whether this command cancels a running scenario instead of
    /// driving it.
    pub fn is_cancel(self) -> bool {
        matches!(self, Command::Pause | Command::UnSetup)
    }
}

/// Overall result code of one command, ordered by severity. Derived
/// `Ord` follows declaration order, so `max` implements the worst-code
/// merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmdErrorCode {
    /// Command accepted, execution in progress.
    Accepted,
    /// Command rejected (another command executing, or invalid state).
    Rejected,
    Succeed,
    ScenarioTimeout,
    /// A module asked to stop the scenario (normal end condition).
    ScenarioStopped,
    InvalidTopicPubSub,
    Failed,
    ScenarioParsingError,
    InvalidModuleConfig,
    SystemError,
}

impl CmdErrorCode {
    /// Whether the code allows the run loop to keep going.
    pub fn is_ok(self) -> bool {
        matches!(self, CmdErrorCode::Accepted | CmdErrorCode::Succeed)
    }
}

/// Per-request result code returned by a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModuleResponseType {
    #[default]
    Ok,
    /// Module requests the scenario to stop (reached its end condition).
    RequireStop,
    /// No reply arrived within the allowed window.
    Timeout,
    Error,
    VersionIncompatible,
    SystemError,
}

/// Init workflow state of one module, driven by the module manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModuleInitState {
    #[default]
    Start,
    Connecting,
    Connected,
    RequestSent,
    Succeed,
    Failed,
}

impl ModuleInitState {
    /// Terminal states end the init workflow for the module.
    pub fn is_terminal(self) -> bool {
        matches!(self, ModuleInitState::Succeed | ModuleInitState::Failed)
    }
}

/// Topic and shared-memory declarations a module announced in its Init
/// response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicPubSubInfo {
    pub sub_topics: Vec<String>,
    pub pub_topics: Vec<String>,
    /// Subscribed shared-memory topics.
    pub sub_shmems: Vec<String>,
    /// Published shared-memory topics with their declared byte sizes.
    pub pub_shmems: Vec<(String, usize)>,
}

impl TopicPubSubInfo {
    pub fn clear(&mut self) {
        self.sub_topics.clear();
        self.pub_topics.clear();
        self.sub_shmems.clear();
        self.pub_shmems.clear();
    }
}

/// Result record of one module for one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleCmdStatus {
    pub name: String,
    pub ec: ModuleResponseType,
    pub msg: String,
}

impl ModuleCmdStatus {
    pub fn new(name: impl Into<String>, ec: ModuleResponseType, msg: impl Into<String>) -> Self {
        Self { name: name.into(), ec, msg: msg.into() }
    }
}

/// Init status record of one module, surfaced to the status stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleInitStatus {
    pub name: String,
    pub state: ModuleInitState,
    /// Log file the module's stdout/stderr is redirected to.
    pub log_file: String,
    /// The module binary changed on disk since its last launch.
    pub binary_updated: bool,
    pub topic_info: TopicPubSubInfo,
}

impl ModuleInitStatus {
    pub fn new(name: impl Into<String>, state: ModuleInitState) -> Self {
        Self { name: name.into(), state, ..Default::default() }
    }
}

/// Running performance counters of one module.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModulePerfStats {
    pub name: String,
    /// Accumulated step wall time [ms].
    pub elapsed_ms: u64,
    /// Worst single step wall time [ms].
    pub max_elapsed_ms: u64,
    pub step_count: u64,
    pub cpu_time_ms: u64,
    pub memory_kb: u64,
    pub fps: f64,
}

/// Topic payloads produced within one step: `(topic, payload_size)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepMessage {
    /// Virtual timestamp of the step [ms].
    pub timestamp_ms: u64,
    pub messages: Vec<(String, usize)>,
}

/// Result record returned up from one orchestration command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandStatus {
    pub ec: Option<CmdErrorCode>,
    pub module_status: Vec<ModuleCmdStatus>,
    pub init_status: Vec<ModuleInitStatus>,
    pub module_perf: Vec<ModulePerfStats>,
    pub step_message: StepMessage,
}

impl CommandStatus {
    pub fn new(ec: CmdErrorCode) -> Self {
        Self { ec: Some(ec), ..Default::default() }
    }

    /// Overall code, defaulting to `Succeed` when nothing was recorded.
    pub fn code(&self) -> CmdErrorCode {
        self.ec.unwrap_or(CmdErrorCode::Succeed)
    }

    /// Worst-code merge: keeps the most severe code seen so far.
    pub fn apply_err_code(&mut self, ec: CmdErrorCode) {
        self.ec = Some(match self.ec {
            Some(current) => current.max(ec),
            None => ec,
        });
    }

    /// Reset to a fresh record for the next step, keeping nothing.
    pub fn clear(&mut self) {
        *self = CommandStatus::default();
    }
}
