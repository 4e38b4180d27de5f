use anyhow::{anyhow, Context};
use chrono::Local;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;

use matrix_ci::config::{self, EnvOverrides, OrchestratorSettings};
use matrix_ci::error::AppError;
use matrix_ci::report;
use matrix_ci::{Job, LogCollector, MatrixPlan, Orchestrator};

/// Plan file picked up when neither --config nor --preset is given
const DEFAULT_PLAN_FILE: &str = "matrix.toml";

#[derive(Parser)]
#[command(name = "matrix_ci")]
#[command(author, version, about = "Expand platform/toolchain axes into isolated build jobs and run them")]
struct Cli {
    /// TOML matrix definition
    #[arg(long, global = true, conflicts_with = "preset")]
    config: Option<PathBuf>,

    /// Built-in matrix definition
    #[arg(long, global = true)]
    preset: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate the matrix definition
    Validate,
    /// List the jobs the matrix expands into
    Expand,
    /// Print the resolved environment of one job
    Env {
        #[arg(long)]
        job: String,
    },
    /// Run jobs and report the outcome
    Run {
        /// Only run these jobs (id or slug); repeatable
        #[arg(long = "job")]
        jobs: Vec<String>,

        /// Jobs running at the same time
        #[arg(long)]
        parallel: Option<usize>,

        /// Parent directory of job workspaces
        #[arg(long)]
        work_dir: Option<PathBuf>,

        /// Log output directory
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Print the JSON report instead of the text summary
        #[arg(long)]
        json: bool,

        /// Keep job workspaces after the run
        #[arg(long)]
        keep_workspaces: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let overrides = EnvOverrides::from_env();

    match execute(cli, overrides).await {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            let message = match e.downcast_ref::<AppError>() {
                Some(app) => app.user_message(),
                None => format!("{:#}", e),
            };
            eprintln!("error: {}", message);
            ExitCode::from(report::EXIT_CONFIG_ERROR as u8)
        }
    }
}

async fn execute(cli: Cli, overrides: EnvOverrides) -> anyhow::Result<i32> {
    let plan = load_plan(&cli, &overrides)?;

    match cli.command {
        Commands::Validate => {
            let jobs = plan.jobs()?;
            println!(
                "ok: '{}' expands to {} job(s) of {} step(s)",
                plan.name,
                jobs.len(),
                plan.steps.len()
            );
            Ok(report::EXIT_SUCCESS)
        }
        Commands::Expand => {
            for job in plan.jobs()? {
                let values: Vec<String> = job
                    .values
                    .iter()
                    .map(|(axis, value)| format!("{}={}", axis, value))
                    .collect();
                println!("{}\t{}\t{}", job.id, job.platform, values.join(" "));
            }
            Ok(report::EXIT_SUCCESS)
        }
        Commands::Env { job } => {
            let jobs = plan.jobs()?;
            let job = select_jobs(jobs, std::slice::from_ref(&job))?
                .pop()
                .ok_or_else(|| AppError::UnknownJob(job.clone()))?;
            let settings = OrchestratorSettings::default();
            let workspace = settings.work_root.join(job.slug());
            let (_cancel_tx, cancel_rx) = watch::channel(false);
            let env = Orchestrator::new(settings, cancel_rx)
                .job_environment(&job, &workspace)
                .with_context(|| format!("resolving environment of '{}'", job.id))?;
            for (key, value) in env {
                println!("{}={}", key, value);
            }
            Ok(report::EXIT_SUCCESS)
        }
        Commands::Run {
            jobs: selected,
            parallel,
            work_dir,
            log_dir,
            json,
            keep_workspaces,
        } => {
            let mut jobs = plan.jobs()?;
            if !selected.is_empty() {
                jobs = select_jobs(jobs, &selected)?;
            }

            let defaults = OrchestratorSettings::default();
            let settings = OrchestratorSettings {
                work_root: work_dir.unwrap_or(defaults.work_root),
                log_dir: log_dir.unwrap_or(defaults.log_dir),
                max_parallel: parallel.unwrap_or(defaults.max_parallel).max(1),
                keep_workspaces,
                ..OrchestratorSettings::default()
            };
            run(&plan, jobs, settings, &overrides, json).await
        }
    }
}

async fn run(
    plan: &MatrixPlan,
    jobs: Vec<Job>,
    settings: OrchestratorSettings,
    overrides: &EnvOverrides,
    json: bool,
) -> anyhow::Result<i32> {
    let log_dir = settings.log_dir.clone();
    let collector = Arc::new(LogCollector::new(log_dir.clone(), !json).map_err(|e| anyhow!(e))?);

    let level = overrides
        .log_level
        .as_deref()
        .map(|l| l.parse::<log::LevelFilter>())
        .transpose()
        .map_err(|_| {
            AppError::InvalidInput(
                "MATRIX_CI_LOG must be one of error, warn, info, debug, trace".to_string(),
            )
        })?
        .unwrap_or(log::LevelFilter::Info);
    if let Err(e) = collector.init_global_logger(level) {
        eprintln!("WARNING: Failed to set LogCollector as global logger: {}", e);
    }

    let session = format!(
        "{}_{}",
        Local::now().format("%Y%m%d_%H%M%S"),
        plan.name.replace(|c: char| !c.is_ascii_alphanumeric(), "-")
    );
    collector.start_new_session(&session).map_err(|e| anyhow!(e))?;
    log::info!(target: "parsed", "matrix_ci {} running '{}'", matrix_ci::VERSION, plan.name);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!(target: "parsed", "Interrupt received, cancelling running jobs");
            let _ = cancel_tx.send(true);
        }
    });

    let orchestrator =
        Orchestrator::new(settings, cancel_rx).with_log_collector(Arc::clone(&collector));
    let result = orchestrator.run_all(jobs).await;

    let document = report::render_json(&result).context("serializing run report")?;
    let report_path = log_dir.join("run-report.json");
    write_report(&report_path, &document)?;

    if json {
        println!("{}", document);
    } else {
        print!("{}", report::render_text(&result));
        println!("report: {}", report_path.display());
    }

    if let Err(e) = collector.wait_for_empty().await {
        eprintln!("WARNING: {}", e);
    }
    Ok(report::exit_code(&result))
}

fn load_plan(cli: &Cli, overrides: &EnvOverrides) -> anyhow::Result<MatrixPlan> {
    let plan = match (&cli.config, &cli.preset) {
        (Some(path), _) => config::load_plan_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        (None, Some(name)) => config::preset(name)?,
        (None, None) => {
            let path = default_plan_path().ok_or_else(|| {
                AppError::InvalidInput(format!(
                    "no {} found; pass --config FILE or --preset NAME (presets: {})",
                    DEFAULT_PLAN_FILE,
                    config::presets::preset_names().join(", ")
                ))
            })?;
            config::load_plan_from_file(&path)
                .with_context(|| format!("loading {}", path.display()))?
        }
    };
    Ok(overrides.apply(&plan)?)
}

/// `./matrix.toml`, then the one in the user config directory.
fn default_plan_path() -> Option<PathBuf> {
    let local = PathBuf::from(DEFAULT_PLAN_FILE);
    if local.exists() {
        return Some(local);
    }
    config::loader::get_user_config_dir()
        .ok()
        .map(|dir| dir.join(DEFAULT_PLAN_FILE))
        .filter(|path| path.exists())
}

/// Keep the jobs named by id or slug, in expansion order.
fn select_jobs(jobs: Vec<Job>, selected: &[String]) -> Result<Vec<Job>, AppError> {
    if let Some(unknown) = selected
        .iter()
        .find(|s| !jobs.iter().any(|j| &j.id == *s || &j.slug() == *s))
    {
        return Err(AppError::UnknownJob(unknown.clone()));
    }
    Ok(jobs
        .into_iter()
        .filter(|j| selected.iter().any(|s| *s == j.id || *s == j.slug()))
        .collect())
}

fn write_report(path: &Path, document: &str) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, document)?;
    Ok(())
}
