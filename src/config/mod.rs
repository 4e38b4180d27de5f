//! Configuration module for matrix definitions and orchestrator settings.
//!
//! # Module Structure
//!
//! - `loader`: Loads and saves TOML matrix definitions
//! - `validator`: Rejects malformed plans before any job executes
//! - `presets`: Built-in plans
//! - `overrides`: `MATRIX_CI_*` environment variables applied on top of a plan
//!
//! # Configuration Flow
//!
//! 1. A plan comes from a TOML file or a preset
//! 2. `EnvOverrides` adjusts profile entries and restricts axes
//! 3. `MatrixPlan::jobs()` validates and expands
//! 4. `OrchestratorSettings` decides where and how jobs run

pub mod loader;
pub mod overrides;
pub mod presets;
pub mod validator;

pub use loader::{load_plan_from_file, save_plan_to_file};
pub use overrides::EnvOverrides;
pub use presets::preset;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Variables copied from the invoking process into every job's base
/// environment unless configured otherwise.
pub const DEFAULT_INHERIT: [&str; 5] = ["PATH", "HOME", "USER", "LANG", "TMPDIR"];

/// Runtime settings for an orchestration run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Parent of every job workspace
    pub work_root: PathBuf,
    /// Log output directory
    pub log_dir: PathBuf,
    /// Jobs running at the same time
    pub max_parallel: usize,
    /// Names copied from the invoking environment into the base environment
    pub inherit: Vec<String>,
    /// Keep job workspaces after the run
    pub keep_workspaces: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        OrchestratorSettings {
            work_root: std::env::temp_dir().join("matrix-ci"),
            log_dir: PathBuf::from("logs"),
            max_parallel: num_cpus::get().max(1),
            inherit: DEFAULT_INHERIT.iter().map(|s| s.to_string()).collect(),
            keep_workspaces: false,
        }
    }
}

impl OrchestratorSettings {
    /// Snapshot the inherited variables from the process environment.
    pub fn base_environment(&self) -> BTreeMap<String, String> {
        self.base_environment_from(|key| std::env::var(key).ok())
    }

    /// Snapshot the inherited variables through a lookup function.
    pub fn base_environment_from<F>(&self, lookup: F) -> BTreeMap<String, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.inherit
            .iter()
            .filter_map(|name| lookup(name).map(|v| (name.clone(), v)))
            .collect()
    }
}
