//! Unified error type hierarchy for matrix_ci
//!
//! Provides structured error handling with ConfigError, ProfileError, StepError
//! and AppError.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Matrix definition loading and validation errors.
///
/// These are surfaced at expansion time, before any job executes, because
/// they cannot be isolated to a single job.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Matrix definition not found: {0}")]
    FileNotFound(String),

    #[error("Invalid TOML in matrix definition: {0}")]
    InvalidToml(#[from] toml::de::Error),

    #[error("Failed to serialize matrix definition: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Matrix validation failed: {0}")]
    ValidationFailed(String),

    #[error("Step template is empty")]
    EmptyStepTemplate,

    #[error("Malformed axis '{axis}': {reason}")]
    MalformedAxis { axis: String, reason: String },

    #[error("Duplicate job identifier: {0}")]
    DuplicateJob(String),

    #[error("Step '{step}' references unknown action '{action}'")]
    UnknownAction { step: String, action: String },

    #[error("Unknown preset: {0}")]
    UnknownPreset(String),

    #[error("IO error during config operations: {0}")]
    IoError(#[from] io::Error),
}

/// Environment profile resolution errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProfileError {
    #[error("Variable '{reference}' referenced by '{entry}' is not defined")]
    UndefinedVariable { entry: String, reference: String },

    #[error("Invalid variable name: '{0}'")]
    InvalidName(String),

    #[error("Unterminated '${{' in value of '{0}'")]
    Unterminated(String),
}

/// Step action execution errors.
///
/// Every variant is an abnormal termination of the action and is handled
/// by the step's failure policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error("Failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },

    #[error("Exited with code {0}")]
    ExitCode(i32),

    #[error("Terminated by signal")]
    Signal,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("Environment error: {0}")]
    Environment(#[from] ProfileError),

    #[error("Workspace error: {0}")]
    Workspace(String),
}

impl StepError {
    /// Exit code reported by the action, if it exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            StepError::ExitCode(code) => Some(*code),
            _ => None,
        }
    }
}

/// Top-level CLI errors
#[derive(Error, Debug, Clone)]
pub enum AppError {
    /// No job matched a `--job` selector
    #[error("No job named '{0}'")]
    UnknownJob(String),

    /// Both or neither of --config/--preset were usable
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// File I/O error (read/write/delete)
    #[error("I/O error: {0}")]
    Io(String),
}

impl AppError {
    /// Get a user-facing error message
    pub fn user_message(&self) -> String {
        match self {
            AppError::UnknownJob(id) => {
                format!("No job '{}' in this matrix; run `matrix_ci expand` to list jobs", id)
            }
            AppError::InvalidInput(msg) => format!("Invalid input: {}", msg),
            AppError::Io(msg) => format!("File operation failed: {}", msg),
        }
    }
}

impl From<io::Error> for AppError {
    fn from(e: io::Error) -> Self {
        AppError::Io(e.to_string())
    }
}
