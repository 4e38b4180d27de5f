//! matrix_ci: matrix build orchestrator
//!
//! Expands a set of axes (platform, toolchain version, ...) into the full
//! cross product of jobs and runs the same ordered step template for every
//! job, each in its own workspace with its own explicit environment. A step
//! can be skipped on some platforms, tolerated when it fails, or fatal.
//! One job's failure never affects another job.
//!
//! The system is organized into functional modules:
//! - **error**: Error type hierarchy
//! - **models**: Axes, steps, jobs and their results
//! - **profile**: Ordered, interpolated environment profiles
//! - **policy**: Skip / tolerant / fatal decision per step and platform
//! - **matrix**: Plan expansion into jobs
//! - **config**: TOML plans, validation, presets, environment overrides
//! - **orchestrator**: Job state machine, step execution, concurrent runs
//! - **log_collector**: Decoupled on-disk logging
//! - **report**: Text and JSON run reports

pub mod config;
pub mod error;
pub mod log_collector;
pub mod matrix;
pub mod models;
pub mod orchestrator;
pub mod policy;
pub mod profile;
pub mod report;

// Re-export the log crate for macro usage
pub use log;

pub use error::{AppError, ConfigError, ProfileError, StepError};
pub use log_collector::{LogCollector, LogLine};
pub use matrix::{expand, MatrixPlan};
pub use models::{
    Axis, FailurePolicy, Job, JobOutcome, JobResult, PlatformGuard, RunResult, Step, StepAction,
    StepRecord, StepStatus,
};
pub use orchestrator::{ActionRunner, Orchestrator, ShellRunner};
pub use policy::StepPolicy;
pub use profile::{EnvEntry, EnvOp, EnvProfile};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
