//! Subflow command line.
//!
//! Usage:
//!     subflow create --mode full-pipeline --source ja --target en --input movie.mkv
//!     subflow run <job-id> [--force-stage translate]
//!     subflow status <job-id>
//!     subflow plan --mode translate-only --enable lyrics_detection
//!     subflow set <job-id> whisper.model=medium --stage transcribe
//!
//! Exit codes: 0 completed, 1 fatal stage failure or other error,
//! 2 cancelled, 3 configuration or plan error.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use subflow_core::config::{ConfigError, ConfigManager, ConfigValue, GlobalLayer, JobOverrides};
use subflow_core::jobs::{JobRequest, JobStore, LanguageConfig, PersistPolicy, StoreError};
use subflow_core::logging::{init_tracing, init_tracing_with_file, LogConfig, LogLevel};
use subflow_core::models::{Feature, FeatureFlags, JobStatus, StageStatus, WorkflowMode};
use subflow_core::orchestrator::{
    CancelHandle, ContextSelector, Dispatcher, OrchestratorError, RunOptions,
};
use subflow_core::planner::{builtin_registry, Plan, PlanError, Planner};

const EXIT_FAILED: u8 = 1;
const EXIT_CANCELLED: u8 = 2;
const EXIT_CONFIG: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "subflow", version, about = "Resumable media subtitle pipeline")]
struct Cli {
    /// Settings file
    #[arg(long, global = true, env = "SUBFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Root folder for job directories (overrides settings)
    #[arg(long, global = true, env = "SUBFLOW_JOBS_ROOT")]
    jobs_root: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a job directory
    Create {
        /// Workflow mode
        #[arg(short, long)]
        mode: WorkflowMode,

        /// Source language tag
        #[arg(short, long)]
        source: String,

        /// Target language tag
        #[arg(short, long)]
        target: Option<String>,

        /// Input media file
        #[arg(long)]
        input: Option<PathBuf>,

        /// Existing transcript (translate-only and format-only)
        #[arg(long)]
        transcript: Option<PathBuf>,

        /// Enable an optional feature (repeatable)
        #[arg(long = "enable")]
        enable: Vec<Feature>,

        /// Explicit job id (a UUID by default)
        #[arg(long)]
        id: Option<String>,
    },

    /// Run or resume a job
    Run {
        job_id: String,

        /// Re-run a stage even if it already succeeded (repeatable)
        #[arg(long = "force-stage")]
        force_stage: Vec<String>,

        /// Also re-run everything downstream of forced stages
        #[arg(long)]
        cascade: bool,
    },

    /// Show a job's stage records
    Status {
        job_id: String,

        /// Print the manifest as JSON
        #[arg(long)]
        json: bool,
    },

    /// Preview the stage order for a mode and feature set
    Plan {
        #[arg(short, long)]
        mode: WorkflowMode,

        #[arg(long = "enable")]
        enable: Vec<Feature>,

        #[arg(long = "disable")]
        disable: Vec<Feature>,

        #[arg(long)]
        json: bool,
    },

    /// Set a configuration override for a job
    Set {
        job_id: String,

        /// `key=value`; value is parsed as bool, integer, number or string
        assignment: String,

        /// Scope the override to one stage
        #[arg(long)]
        stage: Option<String>,
    },

    /// Change a job's feature flags or mode before it runs further
    Edit {
        job_id: String,

        #[arg(long)]
        mode: Option<WorkflowMode>,

        #[arg(long = "enable")]
        enable: Vec<Feature>,

        #[arg(long = "disable")]
        disable: Vec<Feature>,
    },

    /// List jobs
    List,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    let config_or_plan = err
        .downcast_ref::<OrchestratorError>()
        .is_some_and(OrchestratorError::is_config_or_plan)
        || err.downcast_ref::<ConfigError>().is_some()
        || err.downcast_ref::<PlanError>().is_some();
    if config_or_plan {
        EXIT_CONFIG
    } else {
        EXIT_FAILED
    }
}

fn status_exit_code(status: JobStatus) -> u8 {
    match status {
        JobStatus::Completed => 0,
        JobStatus::Cancelled => EXIT_CANCELLED,
        _ => EXIT_FAILED,
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut manager = ConfigManager::new(&config_path);
    manager
        .load_or_create()
        .with_context(|| format!("loading settings from {}", config_path.display()))?;
    manager
        .ensure_dirs_exist()
        .context("creating jobs and logs folders")?;

    let level = if cli.verbose {
        LogLevel::Debug
    } else {
        manager.settings().logging.level.parse().unwrap_or_default()
    };
    let _log_guard = match init_tracing_with_file(level, &manager.logs_folder()) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: file logging disabled: {}", e);
            init_tracing(level);
            None
        }
    };

    let settings = manager.settings();
    let jobs_root = cli.jobs_root.clone().unwrap_or_else(|| manager.jobs_root());
    let store = Arc::new(
        JobStore::new(&jobs_root).with_persist_policy(PersistPolicy::from_settings(&settings.dispatcher)),
    );
    let registry = Arc::new(builtin_registry());
    tracing::debug!(
        config = %config_path.display(),
        jobs_root = %jobs_root.display(),
        "Loaded settings"
    );

    match cli.command {
        Commands::Create {
            mode,
            source,
            target,
            input,
            transcript,
            enable,
            id,
        } => {
            let mut languages = LanguageConfig::new(source);
            if let Some(target) = target {
                languages = languages.with_target(target);
            } else if mode.needs_target_language() {
                bail!("mode {} needs --target", mode);
            }
            let mut features = FeatureFlags::new();
            for feature in enable {
                features.set(feature, true);
            }
            // Validate before anything is written
            Planner::new(&registry).plan(mode, &features)?;

            let mut request = JobRequest::new(mode, languages, features);
            if let Some(id) = id {
                request = request.with_id(id);
            }
            if let Some(input) = input {
                request = request.with_input(absolute(&input)?);
            }
            if let Some(transcript) = transcript {
                request = request.with_transcript(absolute(&transcript)?);
            }
            let job = store.create_job(request)?;
            println!("{}", job.id);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Run {
            job_id,
            force_stage,
            cascade,
        } => {
            let dispatcher = Dispatcher::new(
                registry,
                Arc::clone(&store),
                Arc::new(GlobalLayer::from_settings(settings)),
                ContextSelector::from_settings(&settings.contexts),
            )
            .with_log_config(LogConfig::from_settings(&settings.logging))
            .with_log_callback(Arc::new(|line: &str| println!("{}", line)));

            let cancel = CancelHandle::new();
            let on_interrupt = cancel.clone();
            ctrlc::set_handler(move || {
                eprintln!("Interrupt received; cancelling job");
                on_interrupt.cancel();
            })
            .context("installing Ctrl+C handler")?;

            let options = RunOptions {
                force_rerun: force_stage,
                cascade_rerun: cascade,
                cancel,
            };
            let outcome = dispatcher.run(&job_id, &options)?;
            println!("{}", outcome.summary());
            Ok(ExitCode::from(status_exit_code(outcome.job_status)))
        }

        Commands::Status { job_id, json } => {
            let job = store.load_job(&job_id)?;
            let manifest = store.load_manifest(&job_id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&manifest)?);
                return Ok(ExitCode::SUCCESS);
            }

            println!("Job:    {} ({})", job.id, job.mode);
            println!("Owner:  {}", job.owner);
            println!("Status: {}", manifest.job_status);
            let plan = Planner::new(&registry).plan(job.mode, &job.features);
            let order: Vec<String> = match &plan {
                Ok(plan) => plan.stages.clone(),
                Err(_) => manifest.records.iter().map(|r| r.name.clone()).collect(),
            };
            for stage in &order {
                let Some(record) = manifest.record(stage) else {
                    println!("  {:<20} {}", stage, StageStatus::Pending);
                    continue;
                };
                let mut line = format!(
                    "  {:<20} {:<10} attempts={}",
                    record.name, record.status, record.attempts
                );
                if let Some(ms) = record.duration_ms {
                    line.push_str(&format!(" {:.1}s", ms as f64 / 1000.0));
                }
                if let Some(error) = &record.error {
                    line.push_str(&format!("  error: {}", error));
                }
                println!("{}", line);
            }
            match plan {
                Ok(plan) => print_omitted(&plan),
                Err(e) => println!("Plan error: {}", e),
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Plan {
            mode,
            enable,
            disable,
            json,
        } => {
            let mut features = FeatureFlags::new();
            for feature in enable {
                features.set(feature, true);
            }
            for feature in disable {
                features.set(feature, false);
            }
            let plan = Planner::new(&registry).plan(mode, &features)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
                return Ok(ExitCode::SUCCESS);
            }

            println!("Plan for {} ({})", plan.mode, &plan.fingerprint[..12]);
            for (i, stage) in plan.stages.iter().enumerate() {
                match registry.get(stage) {
                    Some(def) => println!(
                        "  {:>2}. {:<20} context={:<12} {}",
                        i + 1,
                        stage,
                        def.context,
                        def.criticality.as_str()
                    ),
                    None => println!("  {:>2}. {}", i + 1, stage),
                }
            }
            print_omitted(&plan);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Set {
            job_id,
            assignment,
            stage,
        } => {
            let Some((key, raw)) = assignment.split_once('=') else {
                bail!("expected key=value, got '{}'", assignment);
            };
            let key = key.trim();
            if key.is_empty() {
                bail!("empty key in '{}'", assignment);
            }
            if let Some(stage) = &stage {
                if registry.get(stage).is_none() {
                    bail!("unknown stage '{}'", stage);
                }
            }

            let job_dir = store.load_job(&job_id)?.work_dir;
            let path = JobOverrides::path_in(&job_dir);
            let value = ConfigValue::parse_literal(raw.trim());
            match &stage {
                Some(stage) => JobOverrides::set_stage(&path, stage, key, &value)?,
                None => JobOverrides::set_job(&path, key, &value)?,
            }
            println!(
                "{} = {:?} ({})",
                key,
                value.to_env_string(),
                stage.map(|s| format!("stage {}", s)).unwrap_or_else(|| "job".into())
            );
            Ok(ExitCode::SUCCESS)
        }

        Commands::Edit {
            job_id,
            mode,
            enable,
            disable,
        } => {
            let mut job = store.load_job(&job_id)?;
            if let Some(mode) = mode {
                job = match store.update_mode(&job_id, mode) {
                    Ok(job) => job,
                    Err(e @ StoreError::ModeLocked { .. }) => {
                        eprintln!("Error: {}", e);
                        return Ok(ExitCode::from(EXIT_FAILED));
                    }
                    Err(e) => return Err(e.into()),
                };
            }
            if !enable.is_empty() || !disable.is_empty() {
                let mut features = job.features.clone();
                for feature in enable {
                    features.set(feature, true);
                }
                for feature in disable {
                    features.set(feature, false);
                }
                Planner::new(&registry).plan(job.mode, &features)?;
                job = store.update_flags(&job_id, features)?;
            }
            let enabled: Vec<String> = job.features.enabled().iter().map(|f| f.to_string()).collect();
            println!("{} mode={} features=[{}]", job.id, job.mode, enabled.join(", "));
            Ok(ExitCode::SUCCESS)
        }

        Commands::List => {
            for job in store.list_jobs()? {
                let status = store
                    .load_manifest(&job.id)
                    .map(|m| m.job_status.to_string())
                    .unwrap_or_else(|e| format!("unreadable ({})", e));
                println!(
                    "{}  {}  {:<15} {}",
                    job.id,
                    job.created_at.format("%Y-%m-%d %H:%M"),
                    job.mode,
                    status
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_omitted(plan: &Plan) {
    if plan.omitted.is_empty() {
        return;
    }
    println!("Not planned:");
    for omitted in &plan.omitted {
        println!("  {:<20} {}", omitted.name, omitted.reason);
    }
}

fn default_config_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "subflow")
        .map(|dirs| dirs.config_dir().join("settings.toml"))
        .unwrap_or_else(|| PathBuf::from(".subflow/settings.toml"))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if !path.exists() {
        bail!("{} does not exist", path.display());
    }
    path.canonicalize()
        .with_context(|| format!("resolving {}", path.display()))
}
