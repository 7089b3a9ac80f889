use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

/// Protocol version a unit reports back. Bumped whenever the control plane changes shape.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// What log levels are supported?
/// Higher‐value variants are more severe.
#[derive(
    Debug, Copy, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
    EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    #[default]
    Info = 2,
    Warn = 3,
    Error = 4,
    Critical = 5,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

/// Lifecycle of a node unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "camelCase")]
pub enum UnitState {
    #[default]
    Constructed,
    StartingUp,
    Running,
    ShuttingDown,
    Terminated,
}

impl UnitState {
    /// Legal moves of the lifecycle. A unit may be asked to terminate from any
    /// live state, but it never comes back once terminated.
    pub fn can_transition_to(&self, next: UnitState) -> bool {
        use UnitState::*;
        matches!(
            (self, next),
            (Constructed, StartingUp)
                | (Constructed, Terminated)
                | (StartingUp, Running)
                | (StartingUp, ShuttingDown)
                | (Running, ShuttingDown)
                | (ShuttingDown, Terminated)
        )
    }

    pub fn is_live(&self) -> bool {
        matches!(self, UnitState::StartingUp | UnitState::Running)
    }
}

/// Sent once by the orchestrator right after the unit process is spawned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitParams {
    pub version: String,
    pub unit_id: String,
    pub node_type: String,
    #[serde(default)]
    pub args: Value,
    pub context_address: String,
    pub context_secret: String,
    #[serde(default)]
    pub settings: Value,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InitResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InitResult {
    pub fn ok() -> Self {
        Self { success: true, error: None }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self { success: false, error: Some(reason.into()) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateResult {
    pub state: UnitState,
    #[serde(default)]
    pub ticks: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthResult {
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StopResult {
    /// `true` when the stop request was new, `false` if the unit was already stopping.
    pub accepted: bool,
}
