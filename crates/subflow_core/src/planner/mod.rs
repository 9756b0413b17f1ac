//! Workflow planning.
//!
//! A plan is the mode's mandatory stage sequence plus every enabled optional
//! stage whose dependencies are satisfied, inserted where its inputs exist
//! and before anything that consumes its outputs. Planning is pure: the same
//! registry, mode and flags always give the same plan.

mod builtin;
mod error;
mod plan;
mod registry;

pub use builtin::{builtin_registry, IN_PROCESS};
pub use error::{PlanError, PlanResult};
pub use plan::{OmitReason, OmittedStage, Plan, Planner};
pub use registry::{
    Criticality, Fallback, Idempotency, InputSource, InputSpec, StageDefinition, StageRegistry,
};
