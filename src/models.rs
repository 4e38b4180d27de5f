//! Core data types for matrix_ci.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::profile::{EnvEntry, EnvProfile};

/// A named dimension of variation (platform, toolchain version).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Axis {
    pub name: String,
    pub values: Vec<String>,
}

impl Axis {
    pub fn new<S: Into<String>>(name: impl Into<String>, values: impl IntoIterator<Item = S>) -> Self {
        Axis {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// What happens to the job when a step's action fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop the job and mark it failed
    #[default]
    Fatal,
    /// Record a warning and continue with the next step
    Tolerant,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::Fatal => "fatal",
            FailurePolicy::Tolerant => "tolerant",
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Platform predicate deciding whether a step runs for a job.
///
/// Patterns match a platform exactly, or by prefix when they end in `*`
/// (`ubuntu-*` matches `ubuntu-latest`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformGuard {
    #[default]
    Always,
    Only(Vec<String>),
    Except(Vec<String>),
}

impl PlatformGuard {
    pub fn matches(&self, platform: &str) -> bool {
        match self {
            PlatformGuard::Always => true,
            PlatformGuard::Only(patterns) => patterns.iter().any(|p| pattern_matches(p, platform)),
            PlatformGuard::Except(patterns) => !patterns.iter().any(|p| pattern_matches(p, platform)),
        }
    }

    fn is_always(&self) -> bool {
        matches!(self, PlatformGuard::Always)
    }
}

fn pattern_matches(pattern: &str, platform: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => platform.starts_with(prefix),
        None => pattern == platform,
    }
}

/// The body of a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    /// Shell command line, run with `sh -c`
    Run(String),
    /// Reference to a reusable action in the plan's `[actions]` table
    Uses(String),
}

/// One ordered unit of work within a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StepDefinition", into = "StepDefinition")]
pub struct Step {
    pub name: String,
    pub guard: PlatformGuard,
    pub on_failure: FailurePolicy,
    pub action: StepAction,
    /// Entries layered over the job profile for this step only
    pub env: Vec<EnvEntry>,
    /// Relative to the job workspace
    pub working_directory: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl Step {
    pub fn run(name: impl Into<String>, command: impl Into<String>) -> Self {
        Step::with_action(name, StepAction::Run(command.into()))
    }

    pub fn uses(name: impl Into<String>, action: impl Into<String>) -> Self {
        Step::with_action(name, StepAction::Uses(action.into()))
    }

    fn with_action(name: impl Into<String>, action: StepAction) -> Self {
        Step {
            name: name.into(),
            guard: PlatformGuard::Always,
            on_failure: FailurePolicy::Fatal,
            action,
            env: Vec::new(),
            working_directory: None,
            timeout: None,
        }
    }

    pub fn tolerant(mut self) -> Self {
        self.on_failure = FailurePolicy::Tolerant;
        self
    }

    pub fn only<S: Into<String>>(mut self, platforms: impl IntoIterator<Item = S>) -> Self {
        self.guard = PlatformGuard::Only(platforms.into_iter().map(Into::into).collect());
        self
    }

    pub fn except<S: Into<String>>(mut self, platforms: impl IntoIterator<Item = S>) -> Self {
        self.guard = PlatformGuard::Except(platforms.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_env(mut self, entry: EnvEntry) -> Self {
        self.env.push(entry);
        self
    }

    pub fn in_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Serialized form of a [`Step`]: exactly one of `run` / `uses`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    run: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    uses: Option<String>,
    #[serde(default)]
    on_failure: FailurePolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    working_directory: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_secs: Option<u64>,
    // Tables last so TOML output stays valid
    #[serde(default, rename = "if", skip_serializing_if = "PlatformGuard::is_always")]
    guard: PlatformGuard,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    env: Vec<EnvEntry>,
}

impl TryFrom<StepDefinition> for Step {
    type Error = String;

    fn try_from(def: StepDefinition) -> Result<Self, Self::Error> {
        let action = match (def.run, def.uses) {
            (Some(run), None) => StepAction::Run(run),
            (None, Some(uses)) => StepAction::Uses(uses),
            (Some(_), Some(_)) => {
                return Err(format!("step '{}' sets both `run` and `uses`", def.name))
            }
            (None, None) => {
                return Err(format!("step '{}' needs one of `run` or `uses`", def.name))
            }
        };
        Ok(Step {
            name: def.name,
            guard: def.guard,
            on_failure: def.on_failure,
            action,
            env: def.env,
            working_directory: def.working_directory,
            timeout: def.timeout_secs.map(Duration::from_secs),
        })
    }
}

impl From<Step> for StepDefinition {
    fn from(step: Step) -> Self {
        let (run, uses) = match step.action {
            StepAction::Run(cmd) => (Some(cmd), None),
            StepAction::Uses(name) => (None, Some(name)),
        };
        StepDefinition {
            name: step.name,
            run,
            uses,
            guard: step.guard,
            on_failure: step.on_failure,
            env: step.env,
            working_directory: step.working_directory,
            timeout_secs: step.timeout.map(|t| t.as_secs()),
        }
    }
}

/// One concrete combination of axis values with its own execution context.
#[derive(Debug, Clone)]
pub struct Job {
    /// Display identifier, unique within a run
    pub id: String,
    /// Position in expansion order
    pub index: usize,
    /// `(axis, value)` pairs in axis order
    pub values: Vec<(String, String)>,
    pub platform: String,
    pub profile: EnvProfile,
    pub steps: Arc<[Step]>,
    /// Reusable action bodies, by name
    pub actions: Arc<BTreeMap<String, String>>,
    pub timeout: Option<Duration>,
}

impl Job {
    /// Filesystem-safe form of the identifier, unique within one expansion.
    ///
    /// The expansion index leads, so ids that sanitize to the same text
    /// (`a b` and `a-b`) still get distinct workspaces and log files.
    pub fn slug(&self) -> String {
        let mut readable = String::with_capacity(self.id.len());
        let mut last_dash = true;
        for c in self.id.chars() {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
                readable.push(c);
                last_dash = false;
            } else if !last_dash {
                readable.push('-');
                last_dash = true;
            }
        }
        let readable = readable.trim_end_matches('-');
        if readable.is_empty() {
            format!("{:03}", self.index)
        } else {
            format!("{:03}-{}", self.index, readable)
        }
    }

    pub fn value(&self, axis: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(name, _)| name == axis)
            .map(|(_, v)| v.as_str())
    }
}

/// Result of evaluating one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StepStatus {
    Passed,
    /// Guard did not match; neither pass nor fail
    Skipped,
    Failed { policy: FailurePolicy, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    #[serde(flatten)]
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

impl StepRecord {
    pub fn skipped(name: impl Into<String>) -> Self {
        StepRecord {
            name: name.into(),
            status: StepStatus::Skipped,
            exit_code: None,
            started_at: None,
            duration_ms: 0,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.status, StepStatus::Skipped)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, StepStatus::Failed { .. })
    }
}

/// Terminal outcome of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    Passed,
    Failed,
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobOutcome::Passed => "passed",
            JobOutcome::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub platform: String,
    pub values: Vec<(String, String)>,
    pub outcome: JobOutcome,
    /// Every step that was evaluated, in order
    pub steps: Vec<StepRecord>,
    /// One per tolerant failure
    pub warnings: Vec<String>,
    /// Name of the step that failed the job, if any
    pub failed_step: Option<String>,
    pub cancelled: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobResult {
    /// Result for a job that never ran (cancelled before start, task lost).
    pub fn not_run(job: &Job, reason: impl Into<String>, cancelled: bool) -> Self {
        JobResult {
            job_id: job.id.clone(),
            platform: job.platform.clone(),
            values: job.values.clone(),
            outcome: JobOutcome::Failed,
            steps: Vec::new(),
            warnings: vec![reason.into()],
            failed_step: None,
            cancelled,
            started_at: None,
            finished_at: Some(Utc::now()),
        }
    }

    pub fn passed(&self) -> bool {
        self.outcome == JobOutcome::Passed
    }

    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Steps whose action actually ran.
    pub fn executed_steps(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter().filter(|s| !s.is_skipped())
    }
}

/// All job results of one orchestration invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// In expansion order
    pub jobs: Vec<JobResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    /// True iff every job passed.
    pub fn succeeded(&self) -> bool {
        self.jobs.iter().all(JobResult::passed)
    }

    pub fn job(&self, id: &str) -> Option<&JobResult> {
        self.jobs.iter().find(|j| j.job_id == id)
    }

    pub fn failed_jobs(&self) -> impl Iterator<Item = &JobResult> {
        self.jobs.iter().filter(|j| !j.passed())
    }

    pub fn warning_count(&self) -> usize {
        self.jobs.iter().map(|j| j.warnings.len()).sum()
    }
}
