//! Typed error hierarchy for the deploy panel.
//!
//! One enum per subsystem:
//! - `FileError` — workspace sandbox and file manager failures
//! - `SupervisorError` — process supervisor state-machine violations
//! - `DeployError` — deploy pipeline failures

use thiserror::Error;

use crate::panel::models::DeployStage;

/// A client-supplied path resolved outside the workspace root.
///
/// Displays a generic message only; the offending path is never carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Access denied")]
pub struct PathEscapeError;

/// Errors from the workspace sandbox and file manager.
#[derive(Debug, Error)]
pub enum FileError {
    #[error(transparent)]
    PathEscape(#[from] PathEscapeError),

    #[error("Not found: {path}")]
    NotFound { path: String },

    #[error("Not a directory: {path}")]
    NotADirectory { path: String },

    #[error("Cannot delete the workspace root")]
    CannotDeleteRoot,

    #[error("Invalid file name: {0}")]
    InvalidName(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the process supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("A process is already running")]
    AlreadyRunning,

    #[error("No process is running")]
    NotRunning,

    #[error("Failed to spawn '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the deploy pipeline.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("A deploy is already in progress")]
    AlreadyInProgress,

    #[error("Deploy failed during {stage}: {message}")]
    StageFailed { stage: DeployStage, message: String },

    #[error("Failed to stage upload: {0}")]
    Staging(#[source] std::io::Error),
}
