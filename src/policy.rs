//! Step policy engine: skip, tolerant, or fatal.

use serde::{Deserialize, Serialize};

use crate::models::{FailurePolicy, Step};

/// Effective disposition of a step for one job.
///
/// Combines the step's platform guard with its failure policy so the
/// executor handles a single value instead of separate flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepPolicy {
    /// Guard does not match the job's platform
    Skip,
    /// Run; a failure becomes a warning
    Tolerant,
    /// Run; a failure stops the job
    Fatal,
}

impl StepPolicy {
    /// Decide how `step` is handled on `platform`.
    pub fn for_platform(step: &Step, platform: &str) -> Self {
        if !step.guard.matches(platform) {
            return StepPolicy::Skip;
        }
        match step.on_failure {
            FailurePolicy::Fatal => StepPolicy::Fatal,
            FailurePolicy::Tolerant => StepPolicy::Tolerant,
        }
    }

    /// Human-readable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepPolicy::Skip => "skip",
            StepPolicy::Tolerant => "tolerant",
            StepPolicy::Fatal => "fatal",
        }
    }

    /// Does the step run at all?
    pub fn runs(&self) -> bool {
        !matches!(self, StepPolicy::Skip)
    }

    /// Does a failure under this policy stop the job?
    pub fn stops_job_on_failure(&self) -> bool {
        matches!(self, StepPolicy::Fatal)
    }

    /// Failure policy to record for a failed run, `None` when skipped.
    pub fn failure_policy(&self) -> Option<FailurePolicy> {
        match self {
            StepPolicy::Skip => None,
            StepPolicy::Tolerant => Some(FailurePolicy::Tolerant),
            StepPolicy::Fatal => Some(FailurePolicy::Fatal),
        }
    }
}
