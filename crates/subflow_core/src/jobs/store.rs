//! Job and manifest persistence.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

use super::error::{StoreError, StoreResult};
use super::manifest::{Manifest, StageRecord, TransitionDetails};
use super::storage::{FsStorage, ManifestStorage};
use super::types::{
    stage_dir_in, stage_dir_name, Job, JobRequest, INVALIDATED_MARKER, JOB_FILE, LATEST_DIR,
    LOGS_DIR, MANIFEST_FILE, STAGES_DIR,
};
use crate::config::DispatcherSettings;
use crate::models::{FeatureFlags, JobStatus, StageStatus, WorkflowMode};

/// Retry policy for manifest writes.
#[derive(Debug, Clone, Copy)]
pub struct PersistPolicy {
    /// Retries after the first failed write.
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for PersistPolicy {
    fn default() -> Self {
        Self::from_settings(&DispatcherSettings::default())
    }
}

impl PersistPolicy {
    pub fn from_settings(settings: &DispatcherSettings) -> Self {
        Self {
            retries: settings.persist_retries,
            backoff: Duration::from_millis(settings.persist_backoff_ms),
        }
    }
}

/// Owns every job directory under one root.
///
/// The last successfully persisted manifest of each job is cached; a failed
/// write leaves the cache (and the file) at the last-known-good state.
pub struct JobStore {
    root: PathBuf,
    storage: Arc<dyn ManifestStorage>,
    policy: PersistPolicy,
    manifests: Mutex<HashMap<String, Manifest>>,
}

impl JobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            storage: Arc::new(FsStorage),
            policy: PersistPolicy::default(),
            manifests: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the storage backend.
    pub fn with_storage(mut self, storage: Arc<dyn ManifestStorage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_persist_policy(mut self, policy: PersistPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    /// Create a job directory with its fixed layout.
    pub fn create_job(&self, request: JobRequest) -> StoreResult<Job> {
        let id = request
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        validate_job_id(&id)?;

        let work_dir = self.job_dir(&id);
        if work_dir.exists() {
            return Err(StoreError::JobAlreadyExists(id));
        }

        for sub in [STAGES_DIR, LATEST_DIR, LOGS_DIR] {
            fs::create_dir_all(work_dir.join(sub))
                .map_err(|e| StoreError::io(format!("create {}", work_dir.join(sub).display()), e))?;
        }

        let job = Job {
            id,
            created_at: Utc::now(),
            owner: request.owner,
            mode: request.mode,
            languages: request.languages,
            features: request.features,
            work_dir,
            input: request.input,
            transcript: request.transcript,
        };
        self.save_job(&job)?;

        tracing::info!(job_id = %job.id, mode = %job.mode, "Created job");
        Ok(job)
    }

    pub fn load_job(&self, job_id: &str) -> StoreResult<Job> {
        validate_job_id(job_id)?;
        let path = self.job_dir(job_id).join(JOB_FILE);
        let bytes = self
            .storage
            .read(&path)
            .map_err(|e| StoreError::io(format!("read {}", path.display()), e))?
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::corrupt(&path, e))
    }

    /// Replace the job's feature flags. Allowed between runs.
    pub fn update_flags(&self, job_id: &str, features: FeatureFlags) -> StoreResult<Job> {
        let mut job = self.load_job(job_id)?;
        job.features = features;
        self.save_job(&job)?;
        Ok(job)
    }

    /// Change the workflow mode; refused once any stage has executed.
    pub fn update_mode(&self, job_id: &str, mode: WorkflowMode) -> StoreResult<Job> {
        let mut job = self.load_job(job_id)?;
        if job.mode == mode {
            return Ok(job);
        }
        let manifest = self.load_manifest(job_id)?;
        if manifest.has_started() {
            return Err(StoreError::ModeLocked {
                job_id: job_id.to_string(),
                current: job.mode,
                requested: mode,
            });
        }
        job.mode = mode;
        self.save_job(&job)?;
        Ok(job)
    }

    /// All jobs under the root, oldest first. Unreadable entries are skipped.
    pub fn list_jobs(&self) -> StoreResult<Vec<Job>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(format!("list {}", self.root.display()), e)),
        };

        let mut jobs = Vec::new();
        for entry in entries.flatten() {
            if !entry.path().join(JOB_FILE).is_file() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            match self.load_job(&id) {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!(job_id = %id, "Skipping unreadable job: {}", e),
            }
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    /// Read the manifest from disk.
    ///
    /// A missing file yields an empty manifest, so a first run and a resume
    /// take the same path. Records left `running` are normalized to
    /// `pending`.
    pub fn load_manifest(&self, job_id: &str) -> StoreResult<Manifest> {
        validate_job_id(job_id)?;
        let path = self.job_dir(job_id).join(MANIFEST_FILE);
        let bytes = self
            .storage
            .read(&path)
            .map_err(|source| StoreError::ManifestRead {
                path: path.clone(),
                source,
            })?;

        let mut manifest = match bytes {
            None => Manifest::empty(job_id),
            Some(bytes) => {
                let m: Manifest =
                    serde_json::from_slice(&bytes).map_err(|e| StoreError::corrupt(&path, e))?;
                if m.job_id != job_id {
                    return Err(StoreError::corrupt(
                        &path,
                        format!("belongs to job '{}'", m.job_id),
                    ));
                }
                m
            }
        };

        manifest.recover_interrupted();
        for stage in &manifest.recovered {
            tracing::warn!(job_id, stage = %stage, "Stage was running when the previous run stopped; it will be re-run");
        }

        self.manifests
            .lock()
            .insert(job_id.to_string(), manifest.clone());
        Ok(manifest)
    }

    /// Last persisted manifest, loading it if not cached.
    pub fn manifest(&self, job_id: &str) -> StoreResult<Manifest> {
        if let Some(m) = self.manifests.lock().get(job_id) {
            return Ok(m.clone());
        }
        self.load_manifest(job_id)
    }

    /// Apply one stage transition and persist the whole manifest.
    ///
    /// Returns the updated record. On persistence failure nothing changes.
    pub fn record_transition(
        &self,
        job_id: &str,
        stage: &str,
        status: StageStatus,
        details: TransitionDetails,
    ) -> StoreResult<StageRecord> {
        let mut manifest = self.manifest(job_id)?;
        manifest
            .apply(stage, status, &details)
            .map_err(|r| StoreError::InvalidTransition {
                stage: stage.to_string(),
                from: r.from,
                to: r.to,
            })?;
        self.persist(&mut manifest)?;

        let record = manifest
            .record(stage)
            .cloned()
            .unwrap_or_else(|| StageRecord::new(stage));
        tracing::debug!(job_id, stage, status = %status, attempts = record.attempts, "Recorded transition");
        Ok(record)
    }

    /// Make sure every planned stage has a record and an output directory.
    ///
    /// Existing directory assignments are kept so a resume reuses them.
    pub fn sync_plan(
        &self,
        job_id: &str,
        mode: WorkflowMode,
        fingerprint: &str,
        stages: &[String],
    ) -> StoreResult<Manifest> {
        let mut manifest = self.manifest(job_id)?;
        if let Some(previous) = manifest.plan_fingerprint.as_deref() {
            if previous != fingerprint {
                tracing::info!(job_id, "Plan changed since the last run (feature flags edited)");
            }
        }

        manifest.mode = Some(mode);
        manifest.plan_fingerprint = Some(fingerprint.to_string());
        for (position, stage) in stages.iter().enumerate() {
            let record = manifest.ensure_record(stage);
            if record.output_dir.is_none() {
                record.output_dir = Some(stage_dir_name(position, stage));
            }
        }
        self.persist(&mut manifest)?;
        Ok(manifest)
    }

    pub fn set_job_status(&self, job_id: &str, status: JobStatus) -> StoreResult<Manifest> {
        let mut manifest = self.manifest(job_id)?;
        if manifest.job_status == status {
            return Ok(manifest);
        }
        manifest.job_status = status;
        self.persist(&mut manifest)?;
        Ok(manifest)
    }

    /// Force a stage to run again on the next dispatch.
    ///
    /// Artifacts stay on disk; the stage directory gets an `.invalidated`
    /// marker and is moved aside when the stage next starts.
    pub fn mark_for_rerun(&self, job_id: &str, stage: &str) -> StoreResult<()> {
        let mut manifest = self.manifest(job_id)?;
        manifest.reset(stage);

        if let Some(dir) = manifest.record(stage).and_then(|r| r.output_dir.clone()) {
            let stage_dir = stage_dir_in(&self.job_dir(job_id), &dir);
            if stage_dir.is_dir() {
                let marker = stage_dir.join(INVALIDATED_MARKER);
                fs::write(&marker, Utc::now().to_rfc3339())
                    .map_err(|e| StoreError::io(format!("write {}", marker.display()), e))?;
            }
        }

        self.persist(&mut manifest)?;
        tracing::info!(job_id, stage, "Marked stage for re-run");
        Ok(())
    }

    fn save_job(&self, job: &Job) -> StoreResult<()> {
        let path = job.job_file();
        let json = serde_json::to_vec_pretty(job)
            .map_err(|e| StoreError::io("serialize job", std::io::Error::other(e)))?;
        self.storage
            .write_atomic(&path, &json)
            .map_err(|e| StoreError::io(format!("write {}", path.display()), e))
    }

    /// Write the manifest, retrying per policy. The cache only advances
    /// after a successful write.
    fn persist(&self, manifest: &mut Manifest) -> StoreResult<()> {
        manifest.updated_at = Some(Utc::now());
        let path = self.job_dir(&manifest.job_id).join(MANIFEST_FILE);
        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| StoreError::io("serialize manifest", std::io::Error::other(e)))?;

        let attempts = self.policy.retries + 1;
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.storage.write_atomic(&path, &json) {
                Ok(()) => {
                    self.manifests
                        .lock()
                        .insert(manifest.job_id.clone(), manifest.clone());
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        job_id = %manifest.job_id,
                        attempt,
                        attempts,
                        "Manifest write failed: {}",
                        e
                    );
                    last_error = Some(e);
                    if attempt < attempts && !self.policy.backoff.is_zero() {
                        thread::sleep(self.policy.backoff);
                    }
                }
            }
        }

        Err(StoreError::ManifestPersistFailure {
            job_id: manifest.job_id.clone(),
            attempts,
            source: last_error.unwrap_or_else(|| std::io::Error::other("no write attempted")),
        })
    }
}

fn validate_job_id(id: &str) -> StoreResult<()> {
    let bad = id.is_empty()
        || id == "."
        || id == ".."
        || id.chars().any(|c| matches!(c, '/' | '\\' | ':' | '\0'));
    if bad {
        return Err(StoreError::InvalidJobId(id.to_string()));
    }
    Ok(())
}
