use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Severity tag of a log entry shown to operators.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Info,
    Warn,
    Error,
    Success,
    Input,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Success => "success",
            Self::Input => "input",
        }
    }
}

/// One timestamped, severity-tagged line of output. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub kind: LogKind,
    pub text: String,
    pub timestamp: String,
}

impl LogEntry {
    pub fn new(kind: LogKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            timestamp: chrono::Local::now().format("%H:%M:%S").to_string(),
        }
    }
}

/// A directory entry returned by the file manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub is_directory: bool,
    pub size_in_kilobytes: f64,
}

/// Where the code for a deploy comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploySource {
    /// An uploaded archive already staged on disk.
    Archive { staged: PathBuf },
    /// A git repository to clone.
    Repository { url: String },
}

/// A single deploy request. Consumed once.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub source: DeploySource,
    pub run_command: Option<String>,
    pub install_dependencies: bool,
}

/// Ordered stages of a deploy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeployStage {
    StopProcess,
    WipeWorkspace,
    Materialize,
    InstallDependencies,
    StartProcess,
    Cleanup,
}

impl DeployStage {
    /// Every stage, in execution order.
    pub const ALL: [DeployStage; 6] = [
        Self::StopProcess,
        Self::WipeWorkspace,
        Self::Materialize,
        Self::InstallDependencies,
        Self::StartProcess,
        Self::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StopProcess => "stop_process",
            Self::WipeWorkspace => "wipe_workspace",
            Self::Materialize => "materialize",
            Self::InstallDependencies => "install_dependencies",
            Self::StartProcess => "start_process",
            Self::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for DeployStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Externally visible state of the supervised-process slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessState {
    Idle,
    Starting,
    Running { pid: u32 },
    Terminating { pid: u32 },
}
