//! Job store errors.

use std::path::PathBuf;

use thiserror::Error;

use crate::models::{StageStatus, WorkflowMode};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Job '{0}' already exists")]
    JobAlreadyExists(String),

    #[error("Invalid job id '{0}'")]
    InvalidJobId(String),

    #[error("Job '{0}' not found")]
    JobNotFound(String),

    #[error("Job '{job_id}' already ran stages in mode {current}; cannot switch to {requested}")]
    ModeLocked {
        job_id: String,
        current: WorkflowMode,
        requested: WorkflowMode,
    },

    #[error("Failed to read manifest {path}: {source}")]
    ManifestRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Manifest {path} is corrupt: {message}")]
    ManifestCorrupt { path: PathBuf, message: String },

    #[error("Failed to persist manifest for job '{job_id}' after {attempts} attempts: {source}")]
    ManifestPersistFailure {
        job_id: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid transition for stage '{stage}': {from} -> {to}")]
    InvalidTransition {
        stage: String,
        from: StageStatus,
        to: StageStatus,
    },

    #[error("Failed to {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::ManifestCorrupt {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
