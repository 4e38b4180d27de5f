//! Job State Management
//!
//! Tracks a single job through its lifecycle and accumulates the step
//! records that end up in its `JobResult`.
//!
//! ```text
//! Pending -> Running -> Passed
//!                   \-> Failed
//! ```
//!
//! Terminal states are final. A job that must run again is submitted as a
//! fresh job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{FailurePolicy, Job, JobOutcome, JobResult, StepRecord, StepStatus};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Passed,
    Failed,
}

impl JobState {
    /// Get the human-readable name for this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Passed => "passed",
            JobState::Failed => "failed",
        }
    }

    /// Get all valid transitions FROM this state.
    pub fn valid_next_states(&self) -> Vec<JobState> {
        match self {
            JobState::Pending => vec![JobState::Running, JobState::Failed],
            JobState::Running => vec![JobState::Passed, JobState::Failed],
            JobState::Passed | JobState::Failed => vec![],
        }
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        self.valid_next_states().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Passed | JobState::Failed)
    }
}

/// Mutable execution state of one job, owned by the task running it.
#[derive(Debug, Clone)]
pub struct JobExecution {
    job_id: String,
    platform: String,
    values: Vec<(String, String)>,
    state: JobState,
    steps: Vec<StepRecord>,
    warnings: Vec<String>,
    failed_step: Option<String>,
    cancelled: bool,
    aborted: bool,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl JobExecution {
    pub fn new(job: &Job) -> Self {
        JobExecution {
            job_id: job.id.clone(),
            platform: job.platform.clone(),
            values: job.values.clone(),
            state: JobState::Pending,
            steps: Vec::new(),
            warnings: Vec::new(),
            failed_step: None,
            cancelled: false,
            aborted: false,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Attempt to transition to the next state.
    pub fn transition_to(&mut self, next: JobState) -> Result<(), String> {
        if !self.state.can_transition_to(next) {
            return Err(format!(
                "Invalid job state transition for '{}': {} -> {}",
                self.job_id,
                self.state.as_str(),
                next.as_str()
            ));
        }
        match next {
            JobState::Running => self.started_at = Some(Utc::now()),
            JobState::Passed | JobState::Failed => self.finished_at = Some(Utc::now()),
            JobState::Pending => {}
        }
        self.state = next;
        Ok(())
    }

    /// Record an evaluated step. Tolerant failures also produce a warning.
    pub fn record_step(&mut self, record: StepRecord) {
        if let StepStatus::Failed { policy, reason } = &record.status {
            match policy {
                FailurePolicy::Tolerant => self.warnings.push(format!(
                    "step '{}' failed (tolerant): {}",
                    record.name, reason
                )),
                FailurePolicy::Fatal => {
                    if self.failed_step.is_none() {
                        self.failed_step = Some(record.name.clone());
                    }
                }
            }
        }
        self.steps.push(record);
    }

    /// Record a job-level warning not tied to a step.
    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Fail the job for a reason outside any step's policy (workspace
    /// setup, job timeout).
    pub fn abort(&mut self, reason: impl Into<String>) {
        self.warnings.push(format!("job aborted: {}", reason.into()));
        self.aborted = true;
    }

    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Has a fatal step failed?
    pub fn has_fatal_failure(&self) -> bool {
        self.failed_step.is_some()
    }

    /// Drive to a terminal state and produce the result.
    pub fn finish(mut self) -> JobResult {
        if !self.state.is_terminal() {
            let next = if self.has_fatal_failure() || self.cancelled || self.aborted {
                JobState::Failed
            } else {
                JobState::Passed
            };
            if self.state == JobState::Pending && next == JobState::Passed {
                // Never started: nothing passed
                self.state = JobState::Failed;
                self.finished_at = Some(Utc::now());
            } else if let Err(e) = self.transition_to(next) {
                log::error!("{}", e);
                self.state = JobState::Failed;
            }
        }

        let outcome = match self.state {
            JobState::Passed => JobOutcome::Passed,
            _ => JobOutcome::Failed,
        };

        JobResult {
            job_id: self.job_id,
            platform: self.platform,
            values: self.values,
            outcome,
            steps: self.steps,
            warnings: self.warnings,
            failed_step: self.failed_step,
            cancelled: self.cancelled,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}
