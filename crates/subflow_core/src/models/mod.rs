//! Data models shared across the orchestrator.
//!
//! - Enums for workflow modes, features, stage and job status
//! - Feature flag sets carried by jobs

mod enums;
mod flags;

pub use enums::{Feature, JobStatus, StageStatus, WorkflowMode};
pub use flags::FeatureFlags;
