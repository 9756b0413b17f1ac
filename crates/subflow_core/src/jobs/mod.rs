//! Jobs and their manifests.
//!
//! - `JobStore`: creates job directories and owns every manifest write
//! - `Manifest` / `StageRecord`: durable per-stage execution status
//! - `ManifestStorage`: storage seam (filesystem by default)

mod error;
mod manifest;
mod storage;
mod store;
mod types;

pub use error::{StoreError, StoreResult};
pub use manifest::{
    Manifest, StageRecord, TransitionDetails, TransitionRejected, INTERRUPTED_MESSAGE,
    MANIFEST_VERSION,
};
pub use storage::{FsStorage, ManifestStorage};
pub use store::{JobStore, PersistPolicy};
pub use types::{
    stage_dir_name, Job, JobRequest, LanguageConfig, INVALIDATED_MARKER, JOB_FILE, LATEST_DIR,
    LOGS_DIR, MANIFEST_FILE, STAGES_DIR,
};
pub(crate) use types::stage_dir_in;
