//! Step execution: process spawning, output streaming, timeout and
//! cancellation handling.
//!
//! The orchestrator talks to an [`ActionRunner`] so tests can substitute a
//! runner that never touches the host. [`ShellRunner`] is the real one: each
//! step body is handed to `sh -c` with a cleared environment, and its output
//! is streamed line by line into the job's log.

use crate::error::StepError;
use crate::log_collector::LogCollector;
use futures::future::{BoxFuture, FutureExt};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;

/// Everything a runner needs to execute one step.
pub struct StepInvocation<'a> {
    /// Log key of the owning job
    pub job_slug: &'a str,
    pub step_name: &'a str,
    /// Shell text to execute, already resolved from `run` or `uses`
    pub script: &'a str,
    /// The complete process environment; nothing else is inherited
    pub env: &'a BTreeMap<String, String>,
    pub working_dir: &'a Path,
    /// Effective limit for this step (step timeout capped by job deadline)
    pub timeout: Option<Duration>,
    pub cancel_rx: watch::Receiver<bool>,
    pub log_collector: Option<&'a LogCollector>,
}

/// Executes step bodies.
pub trait ActionRunner: Send + Sync {
    /// Run one step to completion. `Ok(())` means the action succeeded.
    fn run<'a>(&'a self, invocation: StepInvocation<'a>) -> BoxFuture<'a, Result<(), StepError>>;
}

/// Runs step bodies through a shell.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for ShellRunner {
    fn default() -> Self {
        ShellRunner {
            program: "sh".to_string(),
            args: vec!["-c".to_string()],
        }
    }
}

impl ActionRunner for ShellRunner {
    fn run<'a>(&'a self, invocation: StepInvocation<'a>) -> BoxFuture<'a, Result<(), StepError>> {
        run_shell_step(self, invocation).boxed()
    }
}

/// How long output still buffered in the pipes is drained once the shell
/// has exited and its process group has been killed.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// One captured pipe, read as raw bytes and split on newlines.
struct OutputStream<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    closed: bool,
}

impl<R: AsyncRead + Unpin> OutputStream<R> {
    fn new(inner: R) -> Self {
        OutputStream {
            reader: BufReader::new(inner),
            buf: Vec::new(),
            closed: false,
        }
    }

    /// Next line, decoded lossily. `None` once the pipe is exhausted.
    ///
    /// Safe to drop mid-read inside `select!`: a partial line stays in
    /// `buf` and is completed by the next call.
    async fn next_line(&mut self) -> Option<String> {
        match self.reader.read_until(b'\n', &mut self.buf).await {
            Ok(0) => {
                self.closed = true;
                (!self.buf.is_empty()).then(|| self.take_line())
            }
            Ok(_) => Some(self.take_line()),
            Err(e) => {
                self.closed = true;
                Some(format!("read error: {}", e))
            }
        }
    }

    fn take_line(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.buf)
            .trim_end_matches(&['\n', '\r'][..])
            .to_string();
        self.buf.clear();
        line
    }
}

/// Spawn the step in its own process group and stream its output.
///
/// # Returns
/// * `Ok(())` if the process exits with status 0
/// * `Err(StepError::ExitCode)` / `Err(StepError::Signal)` otherwise
/// * `Err(StepError::Timeout)` if the deadline passes first
/// * `Err(StepError::Cancelled)` if the cancel flag is raised first
///
/// The step ends when the shell exits, not when its pipes close. Whatever
/// is still running in its process group at that point is killed, so no
/// descendant outlives the step.
pub async fn run_shell_step(
    shell: &ShellRunner,
    invocation: StepInvocation<'_>,
) -> Result<(), StepError> {
    let StepInvocation {
        job_slug,
        step_name,
        script,
        env,
        working_dir,
        timeout,
        mut cancel_rx,
        log_collector,
    } = invocation;

    if *cancel_rx.borrow() {
        return Err(StepError::Cancelled);
    }

    let spawn_error = |reason: String| StepError::Spawn {
        program: shell.program.clone(),
        reason,
    };

    let mut cmd = Command::new(&shell.program);
    cmd.args(&shell.args)
        .arg(script)
        .env_clear()
        .envs(env)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);

    let mut child = cmd.spawn().map_err(|e| spawn_error(e.to_string()))?;
    // The child leads its own group, so its pid names the group
    let group = child.id().map(|pid| Pid::from_raw(pid as i32));
    log::debug!("[{}] step '{}' spawned (pid {:?})", job_slug, step_name, child.id());

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| spawn_error("stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| spawn_error("stderr not captured".to_string()))?;

    let mut stdout = OutputStream::new(stdout);
    let mut stderr = OutputStream::new(stderr);

    let emit = |line: String| {
        if let Some(collector) = log_collector {
            collector.log_job(job_slug, line);
        }
    };

    let deadline = async move {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => futures::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let status = loop {
        tokio::select! {
            line = stdout.next_line(), if !stdout.closed => {
                if let Some(line) = line {
                    emit(line);
                }
            }
            line = stderr.next_line(), if !stderr.closed => {
                if let Some(line) = line {
                    emit(format!("[stderr] {}", line));
                }
            }
            status = child.wait() => break status.map_err(|e| spawn_error(e.to_string()))?,
            _ = &mut deadline => {
                terminate(&mut child, group).await;
                return Err(StepError::Timeout(timeout.unwrap_or_default()));
            }
            _ = wait_for_cancel(&mut cancel_rx) => {
                emit("step cancelled".to_string());
                terminate(&mut child, group).await;
                return Err(StepError::Cancelled);
            }
        }
    };

    // Background processes left by the shell would hold the pipes open
    kill_group(group);
    let drained = tokio::time::timeout(OUTPUT_DRAIN_GRACE, async {
        while !(stdout.closed && stderr.closed) {
            tokio::select! {
                line = stdout.next_line(), if !stdout.closed => {
                    if let Some(line) = line {
                        emit(line);
                    }
                }
                line = stderr.next_line(), if !stderr.closed => {
                    if let Some(line) = line {
                        emit(format!("[stderr] {}", line));
                    }
                }
            }
        }
    })
    .await;
    if drained.is_err() {
        log::debug!("[{}] step '{}' output still open after exit", job_slug, step_name);
    }

    if status.success() {
        Ok(())
    } else if let Some(code) = status.code() {
        Err(StepError::ExitCode(code))
    } else {
        Err(StepError::Signal)
    }
}

/// Resolves once the flag is `true`. Never resolves if the sender is gone.
pub(crate) async fn wait_for_cancel(cancel_rx: &mut watch::Receiver<bool>) {
    loop {
        if *cancel_rx.borrow() {
            return;
        }
        if cancel_rx.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

/// SIGKILL every process in the step's group. An already empty group is fine.
fn kill_group(group: Option<Pid>) {
    if let Some(pgid) = group {
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => log::debug!("killpg({}) failed: {}", pgid, e),
        }
    }
}

/// Kill the child's process group, then the child itself, and reap it.
async fn terminate(child: &mut Child, group: Option<Pid>) {
    kill_group(group);
    if let Err(e) = child.kill().await {
        log::debug!("kill failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn path_env() -> BTreeMap<String, String> {
        let path = std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_string());
        BTreeMap::from([("PATH".to_string(), path)])
    }

    fn invoke<'a>(
        script: &'a str,
        env: &'a BTreeMap<String, String>,
        dir: &'a Path,
        timeout: Option<Duration>,
        cancel_rx: watch::Receiver<bool>,
    ) -> StepInvocation<'a> {
        StepInvocation {
            job_slug: "job",
            step_name: "step",
            script,
            env,
            working_dir: dir,
            timeout,
            cancel_rx,
            log_collector: None,
        }
    }

    #[tokio::test]
    async fn test_exit_codes() {
        let dir = tempfile::tempdir().unwrap();
        let env = BTreeMap::new();
        let (_tx, rx) = watch::channel(false);
        let runner = ShellRunner::default();

        assert!(runner.run(invoke("true", &env, dir.path(), None, rx.clone())).await.is_ok());
        let err = runner
            .run(invoke("exit 3", &env, dir.path(), None, rx))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
    }

    #[tokio::test]
    async fn test_environment_is_exactly_the_given_map() {
        let dir = tempfile::tempdir().unwrap();
        let env = BTreeMap::from([("ONLY".to_string(), "yes".to_string())]);
        let (_tx, rx) = watch::channel(false);
        let runner = ShellRunner::default();

        let script = r#"test "$ONLY" = yes && test -z "$HOME""#;
        assert!(runner.run(invoke(script, &env, dir.path(), None, rx)).await.is_ok());
    }

    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let env = path_env();
        let (_tx, rx) = watch::channel(false);
        ShellRunner::default()
            .run(invoke("touch here", &env, dir.path(), None, rx))
            .await
            .unwrap();
        assert!(dir.path().join("here").exists());
    }

    #[tokio::test]
    async fn test_missing_shell_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let env = BTreeMap::new();
        let (_tx, rx) = watch::channel(false);
        let runner = ShellRunner {
            program: "/nonexistent/shell".to_string(),
            args: vec![],
        };
        let err = runner.run(invoke("true", &env, dir.path(), None, rx)).await.unwrap_err();
        assert!(matches!(err, StepError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_timeout_kills_step() {
        let dir = tempfile::tempdir().unwrap();
        let env = path_env();
        let (_tx, rx) = watch::channel(false);
        let start = Instant::now();
        let err = ShellRunner::default()
            .run(invoke(
                "sleep 30",
                &env,
                dir.path(),
                Some(Duration::from_millis(200)),
                rx,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Timeout(_)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancel_kills_step() {
        let dir = tempfile::tempdir().unwrap();
        let env = path_env();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = tx.send(true);
        });
        let start = Instant::now();
        let err = ShellRunner::default()
            .run(invoke("sleep 30", &env, dir.path(), None, rx))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_undecodable_output_keeps_flowing() {
        let dir = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let collector = LogCollector::new(logs.path().to_path_buf(), false).unwrap();
        let env = path_env();
        let (_tx, rx) = watch::channel(false);

        // Latin-1 bytes followed by far more than a pipe buffer on each stream
        let script = r"printf 'caf\351\n'; printf '\377\n' >&2; head -c 300000 /dev/zero | tr '\0' a; echo; head -c 300000 /dev/zero | tr '\0' b >&2; echo >&2; printf done";
        let result = ShellRunner::default()
            .run(StepInvocation {
                job_slug: "latin1",
                step_name: "build",
                script,
                env: &env,
                working_dir: dir.path(),
                timeout: Some(Duration::from_secs(30)),
                cancel_rx: rx,
                log_collector: Some(&collector),
            })
            .await;
        assert!(result.is_ok(), "{:?}", result);

        collector.wait_for_empty().await.unwrap();
        let log = std::fs::read_to_string(collector.job_log_path("latin1")).unwrap();
        assert!(log.contains("caf\u{FFFD}"));
        assert!(log.contains("[stderr] \u{FFFD}"));
        assert!(log.lines().any(|l| l.ends_with("done")));
    }

    #[tokio::test]
    async fn test_step_ends_when_shell_exits() {
        let dir = tempfile::tempdir().unwrap();
        let env = path_env();
        let (_tx, rx) = watch::channel(false);
        let start = Instant::now();

        ShellRunner::default()
            .run(invoke("(sleep 2; touch late) & echo started", &env, dir.path(), None, rx))
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(1500));

        // The background job was killed with the step's process group
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!dir.path().join("late").exists());
    }

    #[tokio::test]
    async fn test_already_cancelled_never_spawns() {
        let dir = tempfile::tempdir().unwrap();
        let env = BTreeMap::new();
        let (_tx, rx) = watch::channel(true);
        let err = ShellRunner::default()
            .run(invoke("touch spawned", &env, dir.path(), None, rx))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Cancelled));
        assert!(!dir.path().join("spawned").exists());
    }
}
