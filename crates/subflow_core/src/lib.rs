//! Subflow Core - resumable media job pipeline orchestration
//!
//! This crate contains the planning, manifest and dispatch logic with no
//! CLI dependencies. Stage bodies that need their own runtimes are launched
//! through execution contexts; the crate never links them.

pub(crate) mod atomic;
pub mod config;
pub mod jobs;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod planner;
pub mod stageio;
pub mod stages;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
