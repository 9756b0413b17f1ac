//! Settings struct with TOML-based sections.
//!
//! Settings are organized into logical sections that map to TOML tables.
//! Each section can be updated independently for atomic section-level updates.
//! The `[defaults]` and `[stages.<name>]` tables form the global layer of
//! the configuration cascade.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Root settings structure containing all configuration sections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Path-related settings.
    #[serde(default)]
    pub paths: PathSettings,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingSettings,

    /// Dispatcher and manifest persistence settings.
    #[serde(default)]
    pub dispatcher: DispatcherSettings,

    /// Global default values for cascade keys.
    #[serde(default)]
    pub defaults: toml::Table,

    /// Stage-scoped values from the global file, keyed by stage name.
    #[serde(default)]
    pub stages: BTreeMap<String, toml::Table>,

    /// Execution context definitions, keyed by context id.
    #[serde(default)]
    pub contexts: BTreeMap<String, ContextSettings>,
}

/// Path configuration for jobs and logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    /// Root folder holding one working directory per job.
    #[serde(default = "default_jobs_root")]
    pub jobs_root: String,

    /// Folder for application log files.
    #[serde(default = "default_logs_folder")]
    pub logs_folder: String,
}

fn default_jobs_root() -> String {
    ".subflow/jobs".to_string()
}

fn default_logs_folder() -> String {
    ".subflow/logs".to_string()
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            jobs_root: default_jobs_root(),
            logs_folder: default_logs_folder(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Use compact log format (stage output only kept in the tail buffer).
    #[serde(default = "default_true")]
    pub compact: bool,

    /// Number of output lines to show on failure.
    #[serde(default = "default_error_tail")]
    pub error_tail: u32,

    /// Progress update step percentage.
    #[serde(default = "default_progress_step")]
    pub progress_step: u32,

    /// Default level when RUST_LOG is unset.
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_true() -> bool {
    true
}

fn default_error_tail() -> u32 {
    20
}

fn default_progress_step() -> u32 {
    20
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            compact: true,
            error_tail: default_error_tail(),
            progress_step: default_progress_step(),
            level: default_level(),
        }
    }
}

/// Dispatcher behaviour that is not per-stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherSettings {
    /// How many times a failed manifest write is retried before aborting.
    #[serde(default = "default_persist_retries")]
    pub persist_retries: u32,

    /// Delay between manifest write retries.
    #[serde(default = "default_persist_backoff_ms")]
    pub persist_backoff_ms: u64,
}

fn default_persist_retries() -> u32 {
    3
}

fn default_persist_backoff_ms() -> u64 {
    200
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            persist_retries: default_persist_retries(),
            persist_backoff_ms: default_persist_backoff_ms(),
        }
    }
}

/// How to launch stages bound to one execution context.
///
/// ```toml
/// [contexts.whisper]
/// program = "/opt/envs/whisper/bin/python"
/// args = ["-m", "stages.run"]
/// env = { CUDA_VISIBLE_DEVICES = "0" }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSettings {
    /// Executable to run.
    pub program: String,

    /// Arguments; `{stage}` is replaced with the stage name.
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables for the child process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory; defaults to the job directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}
