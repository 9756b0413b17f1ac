//! Artifact exchange between stages.
//!
//! Every stage owns `<job>/stages/NN_<stage>/`. It writes only there; inputs
//! are looked up in the directories of earlier stages, newest first. Final
//! deliverables are copied to `<job>/latest/` under stable names.

mod error;
mod layout;
mod resolver;

pub use error::{StageIoError, StageIoResult};
pub use layout::{StageLayout, StageSlot};
pub use resolver::{StageIo, METADATA_FILE, STALE_DIR};
