//! Job orchestration: runs each job's steps in order under the step policy,
//! and runs many jobs concurrently with failure isolation.
//!
//! ```text
//! run_all(jobs)
//!   ├─ task per job (bounded by a semaphore)
//!   │    run(job): Pending -> Running -> {Passed, Failed}
//!   │      for step in job.steps:
//!   │        Skip     -> record skipped
//!   │        Tolerant -> run; failure = warning
//!   │        Fatal    -> run; failure stops the job
//!   └─ join in expansion order -> RunResult
//! ```

pub mod executor;
pub mod state;
pub mod workspace;

pub use executor::{ActionRunner, ShellRunner, StepInvocation};
pub use state::{JobExecution, JobState};
pub use workspace::JobWorkspace;

use chrono::Utc;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};

use crate::config::OrchestratorSettings;
use crate::error::{ProfileError, StepError};
use crate::log_collector::LogCollector;
use crate::models::{Job, JobResult, RunResult, Step, StepAction, StepRecord, StepStatus};
use crate::policy::StepPolicy;

/// Variable holding the absolute path of the job's workspace
pub const WORKSPACE_VAR: &str = "MATRIX_WORKSPACE";
/// Variable holding the job's display id
pub const JOB_ID_VAR: &str = "MATRIX_JOB_ID";
/// Variable holding the job's platform value
pub const PLATFORM_VAR: &str = "MATRIX_PLATFORM";

/// Runs jobs. Cheap to clone; clones share the runner, logger and cancel flag.
#[derive(Clone)]
pub struct Orchestrator {
    settings: Arc<OrchestratorSettings>,
    /// Explicit base environment every profile resolves over
    base_env: Arc<BTreeMap<String, String>>,
    runner: Arc<dyn ActionRunner>,
    cancel_rx: watch::Receiver<bool>,
    log_collector: Option<Arc<LogCollector>>,
}

impl Orchestrator {
    /// Create an orchestrator that runs steps through `sh -c`, with the base
    /// environment snapshotted from the settings' `inherit` list.
    pub fn new(settings: OrchestratorSettings, cancel_rx: watch::Receiver<bool>) -> Self {
        let base_env = settings.base_environment();
        Orchestrator {
            settings: Arc::new(settings),
            base_env: Arc::new(base_env),
            runner: Arc::new(ShellRunner::default()),
            cancel_rx,
            log_collector: None,
        }
    }

    /// Replace the base environment.
    pub fn with_base_environment(mut self, base_env: BTreeMap<String, String>) -> Self {
        self.base_env = Arc::new(base_env);
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn ActionRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_log_collector(mut self, log_collector: Arc<LogCollector>) -> Self {
        self.log_collector = Some(log_collector);
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Base environment plus the per-job variables.
    fn job_base(&self, job: &Job, workspace: &Path) -> BTreeMap<String, String> {
        let mut base = (*self.base_env).clone();
        base.insert(WORKSPACE_VAR.to_string(), workspace.display().to_string());
        base.insert(JOB_ID_VAR.to_string(), job.id.clone());
        base.insert(PLATFORM_VAR.to_string(), job.platform.clone());
        base
    }

    /// The environment a step of `job` would see with no step-level entries,
    /// for a workspace at `workspace`.
    pub fn job_environment(
        &self,
        job: &Job,
        workspace: &Path,
    ) -> Result<BTreeMap<String, String>, ProfileError> {
        job.profile.resolve(&self.job_base(job, workspace))
    }

    /// The full environment of `step` within `job`.
    pub fn step_environment(
        &self,
        job: &Job,
        step: &Step,
        workspace: &Path,
    ) -> Result<BTreeMap<String, String>, ProfileError> {
        job.profile
            .with_entries(&step.env)
            .resolve(&self.job_base(job, workspace))
    }

    /// Run one job to completion. Never fails: every problem ends up in the
    /// returned `JobResult`.
    pub async fn run(&self, job: &Job) -> JobResult {
        let mut execution = JobExecution::new(job);

        if self.is_cancelled() {
            execution.mark_cancelled();
            execution.warn("cancelled before start");
            log::info!(target: "parsed", "[{}] cancelled before start", job.id);
            return execution.finish();
        }

        if let Err(e) = execution.transition_to(JobState::Running) {
            log::error!("{}", e);
            return execution.finish();
        }
        log::info!(target: "parsed", "==> [{}] started on {}", job.id, job.platform);

        let slug = job.slug();
        let workspace = match JobWorkspace::create(
            &self.settings.work_root,
            &slug,
            self.settings.keep_workspaces,
        ) {
            Ok(ws) => ws,
            Err(e) => {
                log::error!("[{}] {}", job.id, e);
                execution.abort(e.to_string());
                return execution.finish();
            }
        };

        let deadline = job.timeout.map(|limit| (Instant::now() + limit, limit));

        for step in job.steps.iter() {
            let policy = StepPolicy::for_platform(step, &job.platform);
            if !policy.runs() {
                log::debug!("[{}] step '{}' skipped on {}", job.id, step.name, job.platform);
                execution.record_step(StepRecord::skipped(&step.name));
                continue;
            }

            if self.is_cancelled() {
                execution.mark_cancelled();
                break;
            }

            // Effective limit: the step's own, capped by what is left of the job's
            let mut limit = step.timeout;
            let mut job_bound = false;
            if let Some((at, _)) = deadline {
                let remaining = at.saturating_duration_since(Instant::now());
                if limit.map_or(true, |l| remaining < l) {
                    limit = Some(remaining);
                    job_bound = true;
                }
            }

            let started_at = Utc::now();
            let clock = Instant::now();
            let outcome = if limit == Some(Duration::ZERO) {
                Err(StepError::Timeout(Duration::ZERO))
            } else {
                self.execute_step(job, step, &slug, &workspace, limit).await
            };
            let duration_ms = clock.elapsed().as_millis() as u64;

            let error = match outcome {
                Ok(()) => {
                    log::info!("[{}] step '{}' passed", job.id, step.name);
                    execution.record_step(StepRecord {
                        name: step.name.clone(),
                        status: StepStatus::Passed,
                        exit_code: Some(0),
                        started_at: Some(started_at),
                        duration_ms,
                    });
                    continue;
                }
                Err(e) => e,
            };

            let failure_policy = policy.failure_policy().unwrap_or_default();
            let job_timed_out = job_bound && matches!(error, StepError::Timeout(_));
            let reason = match (&error, deadline) {
                (StepError::Timeout(_), Some((_, job_limit))) if job_timed_out => {
                    format!("job timed out after {:?}", job_limit)
                }
                _ => error.to_string(),
            };
            log::warn!(
                target: "parsed",
                "[{}] step '{}' failed ({}): {}",
                job.id,
                step.name,
                failure_policy,
                reason
            );
            execution.record_step(StepRecord {
                name: step.name.clone(),
                status: StepStatus::Failed {
                    policy: failure_policy,
                    reason: reason.clone(),
                },
                exit_code: error.exit_code(),
                started_at: Some(started_at),
                duration_ms,
            });

            if matches!(error, StepError::Cancelled) {
                execution.mark_cancelled();
                break;
            }
            if job_timed_out {
                execution.abort(reason);
                break;
            }
            if policy.stops_job_on_failure() {
                break;
            }
        }

        let result = execution.finish();
        log::info!(
            target: "parsed",
            "==> [{}] {}{}",
            job.id,
            result.outcome,
            if result.cancelled { " (cancelled)" } else { "" }
        );
        drop(workspace);
        result
    }

    async fn execute_step(
        &self,
        job: &Job,
        step: &Step,
        slug: &str,
        workspace: &JobWorkspace,
        timeout: Option<Duration>,
    ) -> Result<(), StepError> {
        let script = resolve_script(job, step)?;
        let env = self.step_environment(job, step, workspace.path())?;
        let working_dir = workspace.step_dir(step.working_directory.as_deref())?;

        if let Some(collector) = &self.log_collector {
            collector.log_job(slug, format!("==> {}", step.name));
        }
        log::debug!("[{}] running '{}': {}", job.id, step.name, script);

        self.runner
            .run(StepInvocation {
                job_slug: slug,
                step_name: &step.name,
                script,
                env: &env,
                working_dir: &working_dir,
                timeout,
                cancel_rx: self.cancel_rx.clone(),
                log_collector: self.log_collector.as_deref(),
            })
            .await
    }

    /// Run every job, at most `max_parallel` at a time. Results are in the
    /// order of `jobs`; a job whose task dies is reported failed on its own.
    pub async fn run_all(&self, jobs: Vec<Job>) -> RunResult {
        let started_at = Utc::now();
        let permits = Arc::new(Semaphore::new(self.settings.max_parallel.max(1)));
        log::info!(
            target: "parsed",
            "Running {} job(s), up to {} at a time",
            jobs.len(),
            self.settings.max_parallel.max(1)
        );

        let handles: Vec<_> = jobs
            .iter()
            .cloned()
            .map(|job| {
                let orchestrator = self.clone();
                let permits = Arc::clone(&permits);
                tokio::spawn(async move {
                    let _permit = match permits.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return JobResult::not_run(&job, "scheduler closed", false),
                    };
                    orchestrator.run(&job).await
                })
            })
            .collect();

        let mut results = Vec::with_capacity(jobs.len());
        for (job, handle) in jobs.iter().zip(handles) {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    log::error!(target: "parsed", "[{}] job task failed: {}", job.id, e);
                    results.push(JobResult::not_run(
                        job,
                        format!("job task failed: {}", e),
                        false,
                    ));
                }
            }
        }

        if let Some(collector) = &self.log_collector {
            if let Err(e) = collector.wait_for_empty().await {
                log::warn!("{}", e);
            }
        }

        RunResult {
            jobs: results,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

/// Shell text for a step: its `run` body, or the named reusable action.
fn resolve_script<'a>(job: &'a Job, step: &'a Step) -> Result<&'a str, StepError> {
    match &step.action {
        StepAction::Run(command) => Ok(command.as_str()),
        StepAction::Uses(name) => job
            .actions
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| StepError::Spawn {
                program: name.clone(),
                reason: "no such action".to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobOutcome;
    use crate::profile::{EnvEntry, EnvProfile};
    use futures::future::{BoxFuture, FutureExt};
    use std::sync::Mutex;

    /// Records step names and fails those listed.
    #[derive(Default)]
    struct ScriptedRunner {
        calls: Mutex<Vec<String>>,
        failing: Vec<&'static str>,
    }

    impl ActionRunner for ScriptedRunner {
        fn run<'a>(&'a self, inv: StepInvocation<'a>) -> BoxFuture<'a, Result<(), StepError>> {
            async move {
                self.calls.lock().unwrap().push(inv.step_name.to_string());
                if self.failing.iter().any(|f| *f == inv.step_name) {
                    Err(StepError::ExitCode(1))
                } else {
                    Ok(())
                }
            }
            .boxed()
        }
    }

    fn job(steps: Vec<Step>) -> Job {
        Job {
            id: "build (linux)".to_string(),
            index: 0,
            values: vec![("os".to_string(), "linux".to_string())],
            platform: "linux".to_string(),
            profile: EnvProfile::default(),
            steps: Arc::from(steps),
            actions: Arc::new(BTreeMap::from([("hello".to_string(), "echo hi".to_string())])),
            timeout: None,
        }
    }

    fn orchestrator(runner: Arc<ScriptedRunner>) -> (Orchestrator, tempfile::TempDir, watch::Sender<bool>) {
        let root = tempfile::tempdir().unwrap();
        let settings = OrchestratorSettings {
            work_root: root.path().to_path_buf(),
            ..OrchestratorSettings::default()
        };
        let (tx, rx) = watch::channel(false);
        let orch = Orchestrator::new(settings, rx)
            .with_base_environment(BTreeMap::new())
            .with_runner(runner);
        (orch, root, tx)
    }

    #[tokio::test]
    async fn test_fatal_failure_stops_job() {
        let runner = Arc::new(ScriptedRunner {
            failing: vec!["a"],
            ..Default::default()
        });
        let (orch, _root, _tx) = orchestrator(Arc::clone(&runner));
        let result = orch
            .run(&job(vec![Step::run("a", "x"), Step::run("b", "x"), Step::run("c", "x")]))
            .await;

        assert_eq!(result.outcome, JobOutcome::Failed);
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.failed_step.as_deref(), Some("a"));
        assert_eq!(*runner.calls.lock().unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_tolerant_failure_continues() {
        let runner = Arc::new(ScriptedRunner {
            failing: vec!["lint"],
            ..Default::default()
        });
        let (orch, _root, _tx) = orchestrator(Arc::clone(&runner));
        let result = orch
            .run(&job(vec![Step::run("lint", "x").tolerant(), Step::run("test", "x")]))
            .await;

        assert_eq!(result.outcome, JobOutcome::Passed);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(*runner.calls.lock().unwrap(), vec!["lint", "test"]);
    }

    #[tokio::test]
    async fn test_guard_skips_without_running() {
        let runner = Arc::new(ScriptedRunner::default());
        let (orch, _root, _tx) = orchestrator(Arc::clone(&runner));
        let result = orch
            .run(&job(vec![Step::run("mac-only", "x").only(["macos-*"]), Step::run("b", "x")]))
            .await;

        assert!(result.passed());
        assert!(result.step("mac-only").unwrap().is_skipped());
        assert_eq!(*runner.calls.lock().unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let runner = Arc::new(ScriptedRunner::default());
        let (orch, _root, tx) = orchestrator(Arc::clone(&runner));
        tx.send(true).unwrap();
        let result = orch.run(&job(vec![Step::run("a", "x")])).await;

        assert!(result.cancelled);
        assert!(!result.passed());
        assert!(result.steps.is_empty());
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_resolve_script() {
        let j = job(vec![]);
        assert_eq!(resolve_script(&j, &Step::run("a", "make")).unwrap(), "make");
        assert_eq!(resolve_script(&j, &Step::uses("a", "hello")).unwrap(), "echo hi");
        assert!(resolve_script(&j, &Step::uses("a", "missing")).is_err());
    }

    #[test]
    fn test_step_environment_layers_step_entries() {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        let orch = Orchestrator::new(OrchestratorSettings::default(), rx)
            .with_base_environment(BTreeMap::from([("PATH".to_string(), "/usr/bin".to_string())]));
        let mut j = job(vec![]);
        j.profile = EnvProfile::new(vec![EnvEntry::prepend("PATH", "${MATRIX_WORKSPACE}/bin")]);
        let step = Step::run("a", "x").with_env(EnvEntry::set("ONLY_HERE", "1"));

        let env = orch.step_environment(&j, &step, Path::new("/ws")).unwrap();
        assert_eq!(env["PATH"], "/ws/bin:/usr/bin");
        assert_eq!(env["ONLY_HERE"], "1");
        assert_eq!(env[JOB_ID_VAR], "build (linux)");
        assert_eq!(env[PLATFORM_VAR], "linux");

        let job_env = orch.job_environment(&j, Path::new("/ws")).unwrap();
        assert!(!job_env.contains_key("ONLY_HERE"));
    }
}
