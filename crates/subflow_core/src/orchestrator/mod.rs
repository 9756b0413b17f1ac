//! Stage execution for planned jobs.
//!
//! # Architecture
//!
//! ```text
//! Dispatcher
//!     ├── Planner           mode + flags → ordered stages
//!     ├── JobStore          manifest transitions, persisted one by one
//!     ├── ConfigCascade     fresh StageConfig per attempt
//!     ├── StageIo           inputs from predecessors, outputs to own dir
//!     └── ContextSelector   context id → ExecutionContext
//!             ├── InProcessContext   (StageBody objects)
//!             └── SubprocessContext  (one child process per attempt)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use subflow_core::config::GlobalLayer;
//! use subflow_core::jobs::JobStore;
//! use subflow_core::orchestrator::{ContextSelector, Dispatcher, RunOptions};
//! use subflow_core::planner::builtin_registry;
//!
//! let store = Arc::new(JobStore::new(".subflow/jobs"));
//! let dispatcher = Dispatcher::new(
//!     Arc::new(builtin_registry()),
//!     store,
//!     Arc::new(GlobalLayer::default()),
//!     ContextSelector::from_settings(&Default::default()),
//! );
//! let outcome = dispatcher.run("my-job", &RunOptions::default()).unwrap();
//! println!("{}", outcome.summary());
//! ```

mod context;
mod dispatcher;
mod errors;

pub use context::{
    stage_env, CancelHandle, ContextSelector, ExecutionContext, InProcessContext, ReportStatus,
    StageBody, StageInvocation, StageReport, SubprocessContext,
};
pub use dispatcher::{
    DegradedStage, DispatchOutcome, Dispatcher, FailedStage, RunOptions, SharedLogCallback,
};
pub use errors::{
    OrchestratorError, OrchestratorResult, StageError, StageErrorKind, StepResult,
};
