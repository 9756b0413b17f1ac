//! Job types and on-disk layout.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{FeatureFlags, WorkflowMode};

/// File names inside a job directory.
pub const JOB_FILE: &str = "job.json";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const STAGES_DIR: &str = "stages";
pub const LATEST_DIR: &str = "latest";
pub const LOGS_DIR: &str = "logs";
/// Marker left in a stage directory whose artifacts must not be reused.
pub const INVALIDATED_MARKER: &str = ".invalidated";

/// Source and target language tags (BCP-47 style, e.g. `ja`, `en-US`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl LanguageConfig {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

/// Parameters for creating a job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Explicit identifier; a UUID is generated when `None`.
    pub id: Option<String>,
    pub owner: String,
    pub mode: WorkflowMode,
    pub languages: LanguageConfig,
    pub features: FeatureFlags,
    /// Source media file.
    pub input: Option<PathBuf>,
    /// Existing transcript for modes that import one.
    pub transcript: Option<PathBuf>,
}

impl JobRequest {
    pub fn new(mode: WorkflowMode, languages: LanguageConfig, features: FeatureFlags) -> Self {
        Self {
            id: None,
            owner: default_owner(),
            mode,
            languages,
            features,
            input: None,
            transcript: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_input(mut self, input: impl Into<PathBuf>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_transcript(mut self, transcript: impl Into<PathBuf>) -> Self {
        self.transcript = Some(transcript.into());
        self
    }
}

fn default_owner() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// One end-to-end unit of work.
///
/// Mutated only through `JobStore`; the working directory layout is fixed
/// at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub owner: String,
    pub mode: WorkflowMode,
    pub languages: LanguageConfig,
    #[serde(default)]
    pub features: FeatureFlags,
    pub work_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<PathBuf>,
}

impl Job {
    pub fn job_file(&self) -> PathBuf {
        self.work_dir.join(JOB_FILE)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.work_dir.join(MANIFEST_FILE)
    }

    pub fn stages_dir(&self) -> PathBuf {
        self.work_dir.join(STAGES_DIR)
    }

    pub fn latest_dir(&self) -> PathBuf {
        self.work_dir.join(LATEST_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.work_dir.join(LOGS_DIR)
    }

    /// Directory for a stage's artifacts given its assigned directory name.
    pub fn stage_dir(&self, dir_name: &str) -> PathBuf {
        stage_dir_in(&self.work_dir, dir_name)
    }
}

pub(crate) fn stage_dir_in(work_dir: &Path, dir_name: &str) -> PathBuf {
    work_dir.join(STAGES_DIR).join(dir_name)
}

/// Directory name for a stage at 0-based plan `position`: `03_transcribe`.
pub fn stage_dir_name(position: usize, stage: &str) -> String {
    format!("{:02}_{}", position + 1, stage)
}
