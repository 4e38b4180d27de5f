//! Run reports: human-readable summary, JSON document, process exit code.

use crate::models::{FailurePolicy, JobResult, RunResult, StepRecord, StepStatus};
use std::fmt::Write;

/// Exit code when every job passed
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code when at least one job failed
pub const EXIT_JOB_FAILED: i32 = 1;
/// Exit code for configuration errors, before any job ran
pub const EXIT_CONFIG_ERROR: i32 = 2;

pub fn exit_code(run: &RunResult) -> i32 {
    if run.succeeded() {
        EXIT_SUCCESS
    } else {
        EXIT_JOB_FAILED
    }
}

/// Per-job, per-step table followed by a one-line summary.
pub fn render_text(run: &RunResult) -> String {
    let mut out = String::new();
    let width = run
        .jobs
        .iter()
        .flat_map(|j| j.steps.iter().map(|s| s.name.len()))
        .max()
        .unwrap_or(0);

    for job in &run.jobs {
        render_job(&mut out, job, width);
    }

    let passed = run.jobs.iter().filter(|j| j.passed()).count();
    let failed = run.jobs.len() - passed;
    let elapsed = (run.finished_at - run.started_at).num_milliseconds().max(0) as u64;
    let _ = writeln!(
        out,
        "{} passed, {} failed, {} warning(s) in {}",
        passed,
        failed,
        run.warning_count(),
        format_duration(elapsed)
    );
    out
}

fn render_job(out: &mut String, job: &JobResult, width: usize) {
    let status = if job.passed() {
        "PASSED"
    } else if job.cancelled {
        "CANCELLED"
    } else {
        "FAILED"
    };
    let _ = writeln!(out, "{} [{}] {}", job.job_id, job.platform, status);

    for step in &job.steps {
        let _ = writeln!(
            out,
            "  {} {:<width$}  {}",
            step_symbol(step),
            step.name,
            step_detail(step),
            width = width
        );
    }
    if let Some(name) = &job.failed_step {
        let _ = writeln!(out, "  failed at '{}' (fatal)", name);
    }
    for warning in &job.warnings {
        let _ = writeln!(out, "  warning: {}", warning);
    }
}

fn step_symbol(step: &StepRecord) -> char {
    match &step.status {
        StepStatus::Passed => '✓',
        StepStatus::Skipped => '–',
        StepStatus::Failed {
            policy: FailurePolicy::Tolerant,
            ..
        } => '⚠',
        StepStatus::Failed { .. } => '✗',
    }
}

fn step_detail(step: &StepRecord) -> String {
    match &step.status {
        StepStatus::Passed => format_duration(step.duration_ms),
        StepStatus::Skipped => "skipped".to_string(),
        StepStatus::Failed { policy, reason } => format!(
            "{} ({}, {})",
            reason,
            policy,
            format_duration(step.duration_ms)
        ),
    }
}

fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1000)
    }
}

/// Pretty-printed JSON document of the whole run.
pub fn render_json(run: &RunResult) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(run)
}
