use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StageIoError {
    #[error("Artifact '{artifact}' needed by stage '{stage}' not found (searched: {})", .searched.join(", "))]
    ArtifactNotFound {
        artifact: String,
        stage: String,
        searched: Vec<String>,
    },

    #[error("Stage '{0}' is not part of this job's layout")]
    UnknownStage(String),

    #[error("Invalid artifact name '{0}': must be a plain file name")]
    InvalidName(String),

    #[error("Invalid metadata in {path}: {message}")]
    Metadata { path: PathBuf, message: String },

    #[error("Failed to {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

impl StageIoError {
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }
}

pub type StageIoResult<T> = Result<T, StageIoError>;
