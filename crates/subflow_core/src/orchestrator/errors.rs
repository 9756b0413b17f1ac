//! Error types for stage execution.
//!
//! Errors that stop a run before any stage starts (config, plan, store)
//! surface as `OrchestratorError`. Errors inside a stage are `StageError`s;
//! they are recorded in the manifest and handled by the stage's criticality.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::jobs::StoreError;
use crate::planner::PlanError;
use crate::stageio::StageIoError;

/// Failure that aborts a dispatch.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Job '{job_id}' setup failed: {message}")]
    SetupFailed { job_id: String, message: String },
}

impl OrchestratorError {
    pub fn setup_failed(job_id: impl Into<String>, message: impl ToString) -> Self {
        Self::SetupFailed {
            job_id: job_id.into(),
            message: message.to_string(),
        }
    }

    /// Whether the error came from configuration or planning.
    pub fn is_config_or_plan(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Plan(_))
    }
}

/// Coarse classification of a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageErrorKind {
    ConfigMissing,
    ArtifactNotFound,
    ContextUnavailable,
    Timeout,
    Interrupted,
    /// Anything else the stage body or its process reported.
    Execution,
}

impl StageErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigMissing => "config_missing",
            Self::ArtifactNotFound => "artifact_not_found",
            Self::ContextUnavailable => "context_unavailable",
            Self::Timeout => "timeout",
            Self::Interrupted => "interrupted",
            Self::Execution => "execution",
        }
    }
}

/// Error from one stage attempt.
#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Artifact(#[from] StageIoError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Execution context '{0}' is not available")]
    ContextUnavailable(String),

    #[error("{tool} failed{}: {message}", .exit_code.map(|c| format!(" with exit code {}", c)).unwrap_or_default())]
    CommandFailed {
        tool: String,
        exit_code: Option<i32>,
        message: String,
    },

    #[error("Stage timed out after {}s", .limit.as_secs())]
    Timeout { limit: Duration },

    #[error("Stage was interrupted")]
    Interrupted,

    #[error("Declared output '{0}' was not produced")]
    MissingOutput(String),

    #[error("Input validation failed: {0}")]
    InvalidInput(String),

    #[error("I/O error in {operation}: {source}")]
    IoError {
        operation: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse {what}: {message}")]
    ParseError { what: String, message: String },

    #[error("{0}")]
    Other(String),
}

impl StageError {
    pub fn command_failed(
        tool: impl Into<String>,
        exit_code: Option<i32>,
        message: impl Into<String>,
    ) -> Self {
        Self::CommandFailed {
            tool: tool.into(),
            exit_code,
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn io_error(operation: impl Into<String>, source: io::Error) -> Self {
        Self::IoError {
            operation: operation.into(),
            source,
        }
    }

    pub fn parse_error(what: impl Into<String>, message: impl ToString) -> Self {
        Self::ParseError {
            what: what.into(),
            message: message.to_string(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    pub fn kind(&self) -> StageErrorKind {
        match self {
            Self::Artifact(StageIoError::ArtifactNotFound { .. }) => StageErrorKind::ArtifactNotFound,
            Self::Config(ConfigError::ConfigMissing { .. }) => StageErrorKind::ConfigMissing,
            Self::ContextUnavailable(_) => StageErrorKind::ContextUnavailable,
            Self::Timeout { .. } => StageErrorKind::Timeout,
            Self::Interrupted => StageErrorKind::Interrupted,
            _ => StageErrorKind::Execution,
        }
    }
}

/// Result type for stage bodies.
pub type StepResult<T> = Result<T, StageError>;

/// Result type for dispatcher operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
