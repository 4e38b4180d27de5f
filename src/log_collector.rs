//! Decoupled logging pipeline for orchestration runs.
//!
//! Every log line goes through one unbounded channel to a background thread
//! that owns all file handles, so step output from any number of concurrent
//! jobs never blocks on disk.
//!
//! # Layout
//!
//! ```text
//! <log_dir>/full/<session>_full.log       every line, all jobs interleaved
//! <log_dir>/parsed/<session>_parsed.log   milestones (target "parsed")
//! <log_dir>/jobs/<slug>.log               raw output of one job
//! ```
//!
//! The collector also implements `log::Log`, so `log::info!` and friends land
//! in the full log, and `log::info!(target: "parsed", ...)` lands in both.

use chrono::Local;
use crossbeam_channel::{unbounded, Sender};
use log::{LevelFilter, Log, Metadata, Record};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Internal log line or special marker
enum LogMessage {
    Line(LogLine),
    /// Flush marker with channel sender to signal completion
    Flush(std::sync::mpsc::Sender<()>),
}

/// Session state with generation tracking for detecting session changes
#[derive(Clone, Debug)]
struct SessionState {
    name: String,
    /// Incremented on every session change so the writer thread drops
    /// handles that point at the previous session's files
    generation: u64,
}

/// Where a line is persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogChannel {
    Full,
    Parsed,
    /// Output of one job, keyed by its slug
    Job(String),
}

/// A log line with metadata
#[derive(Clone, Debug)]
pub struct LogLine {
    pub message: String,
    pub channel: LogChannel,
    /// Wall-clock time the line was produced (HH:MM:SS.mmm)
    pub timestamp: String,
}

impl LogLine {
    fn now() -> String {
        Local::now().format("%H:%M:%S%.3f").to_string()
    }

    pub fn new(message: String) -> Self {
        LogLine {
            message,
            channel: LogChannel::Full,
            timestamp: Self::now(),
        }
    }

    pub fn parsed(message: String) -> Self {
        LogLine {
            message,
            channel: LogChannel::Parsed,
            timestamp: Self::now(),
        }
    }

    pub fn job(slug: impl Into<String>, message: String) -> Self {
        LogLine {
            message,
            channel: LogChannel::Job(slug.into()),
            timestamp: Self::now(),
        }
    }
}

/// Unified logger writing run and job logs on a background thread.
#[derive(Clone)]
pub struct LogCollector {
    /// crossbeam unbounded sender; usable from any thread or runtime
    tx: Sender<LogMessage>,
    log_dir: PathBuf,
    session_state: Arc<Mutex<SessionState>>,
}

impl LogCollector {
    /// Create the log directories and start the writer thread.
    ///
    /// With `echo` set, milestone lines are also printed to stderr.
    pub fn new(log_dir: PathBuf, echo: bool) -> Result<Self, String> {
        for sub in ["full", "parsed", "jobs"] {
            std::fs::create_dir_all(log_dir.join(sub))
                .map_err(|e| format!("Failed to create {} log dir: {}", sub, e))?;
        }

        let (tx, rx) = unbounded::<LogMessage>();
        let session_state = Arc::new(Mutex::new(SessionState {
            name: Local::now().format("%Y%m%d_%H%M%S").to_string(),
            generation: 0,
        }));

        let thread_dir = log_dir.clone();
        let thread_session = Arc::clone(&session_state);
        std::thread::spawn(move || {
            let mut handles: HashMap<PathBuf, File> = HashMap::new();
            let mut last_generation: u64 = 0;

            while let Ok(msg) = rx.recv() {
                match msg {
                    LogMessage::Line(line) => {
                        let session = match thread_session.lock() {
                            Ok(state) => state.clone(),
                            Err(poisoned) => poisoned.into_inner().clone(),
                        };
                        if session.generation != last_generation {
                            handles.clear();
                            last_generation = session.generation;
                        }

                        let full = session_file(&thread_dir, "full", &session.name);
                        match &line.channel {
                            LogChannel::Full => {
                                write_line(&mut handles, &full, &line.timestamp, &line.message);
                            }
                            LogChannel::Parsed => {
                                write_line(&mut handles, &full, &line.timestamp, &line.message);
                                let parsed = session_file(&thread_dir, "parsed", &session.name);
                                write_line(&mut handles, &parsed, &line.timestamp, &line.message);
                                if echo {
                                    eprintln!("{}", line.message);
                                }
                            }
                            LogChannel::Job(slug) => {
                                let tagged = format!("[{}] {}", slug, line.message);
                                write_line(&mut handles, &full, &line.timestamp, &tagged);
                                let job_file = job_file(&thread_dir, slug);
                                write_line(&mut handles, &job_file, &line.timestamp, &line.message);
                            }
                        }
                    }
                    LogMessage::Flush(done) => {
                        for file in handles.values_mut() {
                            let _ = file.flush();
                        }
                        let _ = done.send(());
                    }
                }
            }
        });

        Ok(LogCollector {
            tx,
            log_dir,
            session_state,
        })
    }

    /// Start a new session; subsequent run-level lines go to files named after it.
    pub fn start_new_session(&self, name: &str) -> Result<PathBuf, String> {
        let mut session = self
            .session_state
            .lock()
            .map_err(|e| format!("Failed to lock session state: {}", e))?;
        session.name = name.to_string();
        session.generation = session.generation.wrapping_add(1);
        Ok(session_file(&self.log_dir, "full", name))
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Full log path of the current session
    pub fn full_log_path(&self) -> Option<PathBuf> {
        self.session_state
            .lock()
            .ok()
            .map(|s| session_file(&self.log_dir, "full", &s.name))
    }

    /// Milestone log path of the current session
    pub fn parsed_log_path(&self) -> Option<PathBuf> {
        self.session_state
            .lock()
            .ok()
            .map(|s| session_file(&self.log_dir, "parsed", &s.name))
    }

    pub fn job_log_path(&self, slug: &str) -> PathBuf {
        job_file(&self.log_dir, slug)
    }

    /// Send a log line (non-blocking, never fails)
    pub fn log(&self, line: LogLine) {
        let _ = self.tx.send(LogMessage::Line(line));
    }

    pub fn log_str(&self, message: impl Into<String>) {
        self.log(LogLine::new(message.into()));
    }

    /// Send a milestone line
    pub fn log_parsed(&self, message: impl Into<String>) {
        self.log(LogLine::parsed(message.into()));
    }

    /// Send one line of a job's output
    pub fn log_job(&self, slug: &str, message: impl Into<String>) {
        self.log(LogLine::job(slug, message.into()));
    }

    /// Wait until every line sent before this call is on disk.
    pub async fn wait_for_empty(&self) -> Result<(), String> {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        self.tx
            .send(LogMessage::Flush(tx))
            .map_err(|e| format!("Failed to send flush marker: {}", e))?;
        rx.recv()
            .map_err(|e| format!("Flush signal interrupted: {}", e))?;
        Ok(())
    }

    /// Install a clone of this collector as the global `log` backend.
    pub fn init_global_logger(&self, level: LevelFilter) -> Result<(), log::SetLoggerError> {
        log::set_boxed_logger(Box::new(self.clone()))?;
        log::set_max_level(level);
        Ok(())
    }
}

/// Wires `log` macros into the collector, routing by target.
impl Log for LogCollector {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = format!("[{}] {}", record.level(), record.args());
        if record.target() == "parsed" {
            self.log_parsed(message);
        } else {
            self.log_str(message);
        }
    }

    fn flush(&self) {}
}

fn session_file(log_dir: &Path, kind: &str, session: &str) -> PathBuf {
    log_dir.join(kind).join(format!("{}_{}.log", session, kind))
}

fn job_file(log_dir: &Path, slug: &str) -> PathBuf {
    log_dir.join("jobs").join(format!("{}.log", slug))
}

/// Append one formatted line, opening (and caching) the file on first use.
fn write_line(handles: &mut HashMap<PathBuf, File>, path: &Path, timestamp: &str, message: &str) {
    if !handles.contains_key(path) {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                handles.insert(path.to_path_buf(), file);
            }
            Err(e) => {
                eprintln!("[Log] Failed to open {}: {}", path.display(), e);
                return;
            }
        }
    }
    if let Some(file) = handles.get_mut(path) {
        let _ = writeln!(file, "[{}] {}", timestamp, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn test_log_collector_creates_directories() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("logs");

        let result = LogCollector::new(dir.clone(), false);
        assert!(result.is_ok());
        assert!(dir.join("full").exists());
        assert!(dir.join("parsed").exists());
        assert!(dir.join("jobs").exists());
    }

    #[tokio::test]
    async fn test_log_collector_non_blocking() {
        let temp = tempfile::tempdir().unwrap();
        let collector = LogCollector::new(temp.path().to_path_buf(), false).unwrap();
        collector.start_new_session("run").unwrap();

        for i in 0..1000 {
            collector.log_str(format!("Log message {}", i));
        }
        collector.wait_for_empty().await.unwrap();

        let content = fs::read_to_string(collector.full_log_path().unwrap()).unwrap();
        assert_eq!(content.lines().count(), 1000);
        assert!(content.lines().last().unwrap().ends_with("Log message 999"));
    }

    #[tokio::test]
    async fn test_job_lines_routed_to_job_file() {
        let temp = tempfile::tempdir().unwrap();
        let collector = LogCollector::new(temp.path().to_path_buf(), false).unwrap();
        collector.start_new_session("run").unwrap();

        collector.log_job("build-linux", "compiling");
        collector.log_parsed("JOB START build (linux)");
        collector.wait_for_empty().await.unwrap();

        let job = fs::read_to_string(collector.job_log_path("build-linux")).unwrap();
        assert!(job.contains("compiling"));
        assert!(!job.contains("JOB START"));

        let full = fs::read_to_string(collector.full_log_path().unwrap()).unwrap();
        assert!(full.contains("[build-linux] compiling"));
        assert!(full.contains("JOB START"));

        let parsed = fs::read_to_string(collector.parsed_log_path().unwrap()).unwrap();
        assert!(parsed.contains("JOB START"));
        assert!(!parsed.contains("compiling"));
    }

    #[tokio::test]
    async fn test_new_session_switches_files() {
        let temp = tempfile::tempdir().unwrap();
        let collector = LogCollector::new(temp.path().to_path_buf(), false).unwrap();

        let first = collector.start_new_session("first").unwrap();
        collector.log_str("one");
        collector.wait_for_empty().await.unwrap();
        let second = collector.start_new_session("second").unwrap();
        collector.log_str("two");
        collector.wait_for_empty().await.unwrap();

        assert_ne!(first, second);
        assert!(!fs::read_to_string(&first).unwrap().contains("two"));
        assert!(fs::read_to_string(&second).unwrap().contains("two"));
    }
}
