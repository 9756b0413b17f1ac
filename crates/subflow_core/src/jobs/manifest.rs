//! Persisted per-stage execution records.
//!
//! The manifest is the durable record of a job. It is rewritten as a whole
//! (atomically) after every transition, so readers only ever see a complete
//! document. A record still marked `running` on load belongs to a run that
//! died mid-stage; it is normalized to `pending` and never trusted as done.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{JobStatus, StageStatus, WorkflowMode};

/// Manifest format version.
pub const MANIFEST_VERSION: u32 = 1;

/// Error text stored on records recovered from a crashed run.
pub const INTERRUPTED_MESSAGE: &str = "interrupted: previous run stopped while this stage was running";

/// One row per (job, stage) pair actually scheduled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    #[serde(default)]
    pub status: StageStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Directory name under `stages/`, fixed once assigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
    /// Artifacts from an earlier run must not be used.
    #[serde(default)]
    pub invalidated: bool,
}

impl StageRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StageStatus::Pending,
            attempts: 0,
            started_at: None,
            ended_at: None,
            duration_ms: None,
            error: None,
            output_dir: None,
            invalidated: false,
        }
    }
}

/// Extra data carried by a transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionDetails {
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
}

impl TransitionDetails {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            duration_ms: None,
        }
    }

    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }
}

/// Rejected status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRejected {
    pub from: StageStatus,
    pub to: StageStatus,
}

/// Durable record of per-stage execution status for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub job_id: String,
    /// Mode the records were produced under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<WorkflowMode>,
    /// Fingerprint of the last synced plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_fingerprint: Option<String>,
    #[serde(default)]
    pub job_status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub records: Vec<StageRecord>,
    /// Stages normalized from `running` when this manifest was loaded.
    #[serde(skip)]
    pub recovered: Vec<String>,
}

impl Manifest {
    /// Manifest for a job that has never run.
    pub fn empty(job_id: impl Into<String>) -> Self {
        Self {
            version: MANIFEST_VERSION,
            job_id: job_id.into(),
            mode: None,
            plan_fingerprint: None,
            job_status: JobStatus::NotStarted,
            updated_at: None,
            records: Vec::new(),
            recovered: Vec::new(),
        }
    }

    pub fn record(&self, stage: &str) -> Option<&StageRecord> {
        self.records.iter().find(|r| r.name == stage)
    }

    /// Status of a stage; absent records count as pending.
    pub fn status_of(&self, stage: &str) -> StageStatus {
        self.record(stage).map(|r| r.status).unwrap_or_default()
    }

    /// Get or create the record for `stage`; keeps exactly one per stage.
    pub fn ensure_record(&mut self, stage: &str) -> &mut StageRecord {
        let idx = match self.records.iter().position(|r| r.name == stage) {
            Some(i) => i,
            None => {
                self.records.push(StageRecord::new(stage));
                self.records.len() - 1
            }
        };
        &mut self.records[idx]
    }

    /// Whether any stage has ever been attempted.
    pub fn has_started(&self) -> bool {
        self.records
            .iter()
            .any(|r| r.attempts > 0 || r.status != StageStatus::Pending)
    }

    /// Apply a dispatcher transition to one record.
    pub fn apply(
        &mut self,
        stage: &str,
        to: StageStatus,
        details: &TransitionDetails,
    ) -> Result<(), TransitionRejected> {
        let now = Utc::now();
        let record = self.ensure_record(stage);
        let from = record.status;
        if !from.can_transition_to(to) {
            return Err(TransitionRejected { from, to });
        }

        match to {
            StageStatus::Running => {
                record.attempts += 1;
                record.started_at = Some(now);
                record.ended_at = None;
                record.duration_ms = None;
                record.error = None;
            }
            StageStatus::Succeeded | StageStatus::Failed | StageStatus::Skipped => {
                record.ended_at = Some(now);
                record.duration_ms = details.duration_ms.or_else(|| {
                    record
                        .started_at
                        .map(|s| (now - s).num_milliseconds().max(0) as u64)
                });
                record.error = details.error.clone();
                if to == StageStatus::Succeeded {
                    record.invalidated = false;
                }
            }
            StageStatus::Pending => {
                record.ended_at = Some(now);
                record.error = details.error.clone();
            }
        }
        record.status = to;
        self.updated_at = Some(now);
        Ok(())
    }

    /// Forced re-run: back to pending with artifacts marked invalid.
    pub fn reset(&mut self, stage: &str) {
        let record = self.ensure_record(stage);
        record.status = StageStatus::Pending;
        record.attempts = 0;
        record.started_at = None;
        record.ended_at = None;
        record.duration_ms = None;
        record.error = None;
        record.invalidated = true;
        self.updated_at = Some(Utc::now());
    }

    /// Normalize records left `running` by a crashed run.
    pub fn recover_interrupted(&mut self) {
        for record in &mut self.records {
            if record.status == StageStatus::Running {
                record.status = StageStatus::Pending;
                record.error = Some(INTERRUPTED_MESSAGE.to_string());
                self.recovered.push(record.name.clone());
            }
        }
        if self.job_status == JobStatus::Running {
            self.job_status = JobStatus::Cancelled;
        }
    }
}
