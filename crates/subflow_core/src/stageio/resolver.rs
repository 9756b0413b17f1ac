//! Per-stage artifact resolver.

use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};

use chrono::Utc;
use serde_json::{Map, Value};

use super::error::{StageIoError, StageIoResult};
use super::layout::StageSlot;
use crate::atomic::{temp_path_for, write_atomic};
use crate::jobs::{INVALIDATED_MARKER, LATEST_DIR, STAGES_DIR};

/// Metadata sidecar written next to a stage's artifacts.
pub const METADATA_FILE: &str = "stage_meta.json";
/// Invalidated stage directories are moved here instead of deleted.
pub const STALE_DIR: &str = ".stale";

/// Artifact resolver bound to one stage of one job.
#[derive(Debug, Clone)]
pub struct StageIo {
    job_dir: PathBuf,
    stage: String,
    stage_dir: PathBuf,
    invalidated: bool,
    /// Earlier stages in execution order.
    predecessors: Vec<StageSlot>,
}

impl StageIo {
    pub fn new(
        job_dir: impl Into<PathBuf>,
        stage: impl Into<String>,
        stage_dir: PathBuf,
        invalidated: bool,
        predecessors: Vec<StageSlot>,
    ) -> Self {
        Self {
            job_dir: job_dir.into(),
            stage: stage.into(),
            stage_dir,
            invalidated,
            predecessors,
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn stage_dir(&self) -> &Path {
        &self.stage_dir
    }

    pub fn job_dir(&self) -> &Path {
        &self.job_dir
    }

    pub fn latest_dir(&self) -> PathBuf {
        self.job_dir.join(LATEST_DIR)
    }

    pub fn predecessors(&self) -> &[StageSlot] {
        &self.predecessors
    }

    /// Locate an input artifact.
    ///
    /// With `from_stage` only that stage's directory is searched. Otherwise
    /// predecessors are searched newest first, so a stage that rewrites
    /// `transcript.json` shadows the original producer. Directories of
    /// stages that did not succeed, or were invalidated, are never used.
    pub fn resolve_input(&self, name: &str, from_stage: Option<&str>) -> StageIoResult<PathBuf> {
        check_name(name)?;

        let candidates: Vec<&StageSlot> = match from_stage {
            Some(source) => self.predecessors.iter().filter(|s| s.name == source).collect(),
            None => self.predecessors.iter().rev().collect(),
        };

        for slot in &candidates {
            if !slot.usable || slot.dir.join(INVALIDATED_MARKER).exists() {
                continue;
            }
            let path = slot.dir.join(name);
            if path.is_file() {
                return Ok(path);
            }
        }

        Err(StageIoError::ArtifactNotFound {
            artifact: name.to_string(),
            stage: self.stage.clone(),
            searched: candidates.iter().map(|s| s.name.clone()).collect(),
        })
    }

    /// `resolve_input` for optional inputs: absent is `None`.
    pub fn resolve_optional(&self, name: &str) -> Option<PathBuf> {
        self.resolve_input(name, None).ok()
    }

    /// Reserve a path for an output artifact in this stage's directory.
    pub fn write_output(&self, name: &str) -> StageIoResult<PathBuf> {
        check_name(name)?;
        fs::create_dir_all(&self.stage_dir)
            .map_err(|e| StageIoError::io(format!("create {}", self.stage_dir.display()), e))?;
        Ok(self.stage_dir.join(name))
    }

    /// Path of an artifact this stage has produced, if present.
    pub fn output(&self, name: &str) -> Option<PathBuf> {
        let path = self.stage_dir.join(name);
        path.is_file().then_some(path)
    }

    pub fn save_metadata(&self, metadata: &Map<String, Value>) -> StageIoResult<PathBuf> {
        let path = self.write_output(METADATA_FILE)?;
        let json = serde_json::to_vec_pretty(metadata).map_err(|e| StageIoError::Metadata {
            path: path.clone(),
            message: e.to_string(),
        })?;
        write_atomic(&path, &json)
            .map_err(|e| StageIoError::io(format!("write {}", path.display()), e))?;
        Ok(path)
    }

    /// This stage's metadata; empty when none was saved.
    pub fn load_metadata(&self) -> StageIoResult<Map<String, Value>> {
        read_metadata(&self.stage_dir.join(METADATA_FILE))
    }

    /// Metadata of an earlier stage; empty when it saved none.
    pub fn load_metadata_from(&self, stage: &str) -> StageIoResult<Map<String, Value>> {
        let slot = self
            .predecessors
            .iter()
            .find(|s| s.name == stage)
            .ok_or_else(|| StageIoError::UnknownStage(stage.to_string()))?;
        if !slot.usable {
            return Ok(Map::new());
        }
        read_metadata(&slot.dir.join(METADATA_FILE))
    }

    /// Copy one of this stage's artifacts to `<job>/latest/<name>`.
    pub fn promote(&self, name: &str) -> StageIoResult<PathBuf> {
        check_name(name)?;
        let source = self.stage_dir.join(name);
        if !source.is_file() {
            return Err(StageIoError::ArtifactNotFound {
                artifact: name.to_string(),
                stage: self.stage.clone(),
                searched: vec![self.stage.clone()],
            });
        }

        let latest = self.latest_dir();
        fs::create_dir_all(&latest)
            .map_err(|e| StageIoError::io(format!("create {}", latest.display()), e))?;
        let dest = latest.join(name);
        let temp = temp_path_for(&dest);

        fs::copy(&source, &temp)
            .map_err(|e| StageIoError::io(format!("copy {} to {}", source.display(), temp.display()), e))?;
        File::open(&temp)
            .and_then(|f| f.sync_all())
            .map_err(|e| StageIoError::io(format!("sync {}", temp.display()), e))?;
        fs::rename(&temp, &dest).map_err(|e| {
            let _ = fs::remove_file(&temp);
            StageIoError::io(format!("rename to {}", dest.display()), e)
        })?;

        tracing::debug!(stage = %self.stage, artifact = name, "Promoted artifact");
        Ok(dest)
    }

    /// Ready the stage directory before an attempt.
    ///
    /// A non-empty directory that is invalidated, or that an earlier attempt
    /// wrote to (`after_attempt`), is moved to `stages/.stale/` and a fresh
    /// one created. Returns where the old directory went.
    pub fn prepare(&self, after_attempt: bool) -> StageIoResult<Option<PathBuf>> {
        let marked = self.stage_dir.join(INVALIDATED_MARKER).exists();
        let mut moved = None;

        let has_content = fs::read_dir(&self.stage_dir)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);

        if has_content && (self.invalidated || marked || after_attempt) {
            let stale_root = self.job_dir.join(STAGES_DIR).join(STALE_DIR);
            fs::create_dir_all(&stale_root)
                .map_err(|e| StageIoError::io(format!("create {}", stale_root.display()), e))?;

            let dir_name = self
                .stage_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.stage.clone());
            let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
            let mut target = stale_root.join(format!("{}-{}", dir_name, stamp));
            let mut n = 1;
            while target.exists() {
                target = stale_root.join(format!("{}-{}-{}", dir_name, stamp, n));
                n += 1;
            }

            fs::rename(&self.stage_dir, &target)
                .map_err(|e| StageIoError::io(format!("move {} aside", self.stage_dir.display()), e))?;
            tracing::info!(stage = %self.stage, to = %target.display(), "Moved previous artifacts aside");
            moved = Some(target);
        }

        fs::create_dir_all(&self.stage_dir)
            .map_err(|e| StageIoError::io(format!("create {}", self.stage_dir.display()), e))?;
        Ok(moved)
    }
}

fn check_name(name: &str) -> StageIoResult<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(StageIoError::InvalidName(name.to_string())),
    }
}

fn read_metadata(path: &Path) -> StageIoResult<Map<String, Value>> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(e) => return Err(StageIoError::io(format!("read {}", path.display()), e)),
    };
    serde_json::from_slice(&bytes).map_err(|e| StageIoError::Metadata {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn slot(job: &Path, name: &str, dir: &str, usable: bool) -> StageSlot {
        StageSlot {
            name: name.into(),
            dir: job.join(STAGES_DIR).join(dir),
            usable,
            invalidated: false,
        }
    }

    fn put(dir: &Path, name: &str, content: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(name), content).unwrap();
    }

    fn io_after(job: &Path, stage: &str, dir: &str, preds: Vec<StageSlot>) -> StageIo {
        StageIo::new(job, stage, job.join(STAGES_DIR).join(dir), false, preds)
    }

    #[test]
    fn nearest_producer_wins() {
        let tmp = tempdir().unwrap();
        let job = tmp.path();
        let a = slot(job, "transcribe", "02_transcribe", true);
        let b = slot(job, "entity_correction", "03_entity_correction", true);
        put(&a.dir, "transcript.json", "raw");
        put(&b.dir, "transcript.json", "corrected");

        let io = io_after(job, "translate", "04_translate", vec![a, b]);
        let found = io.resolve_input("transcript.json", None).unwrap();
        assert_eq!(fs::read_to_string(found).unwrap(), "corrected");

        let pinned = io.resolve_input("transcript.json", Some("transcribe")).unwrap();
        assert_eq!(fs::read_to_string(pinned).unwrap(), "raw");
    }

    #[test]
    fn unusable_directories_are_skipped() {
        let tmp = tempdir().unwrap();
        let job = tmp.path();
        let a = slot(job, "transcribe", "02_transcribe", true);
        let b = slot(job, "entity_correction", "03_entity_correction", false);
        put(&a.dir, "transcript.json", "raw");
        put(&b.dir, "transcript.json", "half-written");

        let io = io_after(job, "translate", "04_translate", vec![a, b]);
        let found = io.resolve_input("transcript.json", None).unwrap();
        assert_eq!(fs::read_to_string(found).unwrap(), "raw");
    }

    #[test]
    fn marker_file_hides_directory() {
        let tmp = tempdir().unwrap();
        let job = tmp.path();
        let a = slot(job, "lyrics_detection", "03_lyrics_detection", true);
        put(&a.dir, "lyrics.json", "[]");
        put(&a.dir, INVALIDATED_MARKER, "");

        let io = io_after(job, "translate", "05_translate", vec![a]);
        assert!(io.resolve_optional("lyrics.json").is_none());
    }

    #[test]
    fn missing_artifact_lists_searched_stages() {
        let tmp = tempdir().unwrap();
        let job = tmp.path();
        let io = io_after(
            job,
            "translate",
            "03_translate",
            vec![slot(job, "extract_audio", "01_extract_audio", true), slot(job, "transcribe", "02_transcribe", true)],
        );
        match io.resolve_input("lyrics.json", None).unwrap_err() {
            StageIoError::ArtifactNotFound { searched, stage, .. } => {
                assert_eq!(stage, "translate");
                assert_eq!(searched, vec!["transcribe", "extract_audio"]);
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn outputs_stay_inside_stage_dir() {
        let tmp = tempdir().unwrap();
        let io = io_after(tmp.path(), "transcribe", "02_transcribe", vec![]);
        let path = io.write_output("transcript.json").unwrap();
        assert_eq!(path.parent().unwrap(), io.stage_dir());
        assert!(io.stage_dir().is_dir());

        assert!(matches!(io.write_output("../escape.json"), Err(StageIoError::InvalidName(_))));
        assert!(matches!(io.write_output("sub/dir.json"), Err(StageIoError::InvalidName(_))));
        assert!(matches!(io.write_output(""), Err(StageIoError::InvalidName(_))));
    }

    #[test]
    fn metadata_round_trip_between_stages() {
        let tmp = tempdir().unwrap();
        let job = tmp.path();
        let producer = io_after(job, "transcribe", "02_transcribe", vec![]);
        let mut meta = Map::new();
        meta.insert("model".into(), json!("large-v3"));
        meta.insert("segments".into(), json!(412));
        producer.save_metadata(&meta).unwrap();
        assert_eq!(producer.load_metadata().unwrap(), meta);

        let consumer = io_after(
            job,
            "translate",
            "03_translate",
            vec![slot(job, "transcribe", "02_transcribe", true)],
        );
        assert_eq!(consumer.load_metadata_from("transcribe").unwrap()["segments"], json!(412));
        assert!(consumer.load_metadata().unwrap().is_empty());
    }

    #[test]
    fn promote_copies_to_latest() {
        let tmp = tempdir().unwrap();
        let io = io_after(tmp.path(), "format_subtitles", "04_format_subtitles", vec![]);
        fs::write(io.write_output("subtitles.srt").unwrap(), "1\n00:00:01,000 --> 00:00:02,000\nhi\n").unwrap();

        let dest = io.promote("subtitles.srt").unwrap();
        assert_eq!(dest, tmp.path().join("latest").join("subtitles.srt"));
        assert!(fs::read_to_string(&dest).unwrap().contains("hi"));
        assert!(io.output("subtitles.srt").is_some());
        assert!(!temp_path_for(&dest).exists());
    }

    #[test]
    fn prepare_moves_invalidated_dir_aside() {
        let tmp = tempdir().unwrap();
        let job = tmp.path();
        let dir = job.join(STAGES_DIR).join("02_transcribe");
        put(&dir, "transcript.json", "old");
        put(&dir, INVALIDATED_MARKER, "");

        let io = StageIo::new(job, "transcribe", dir.clone(), true, vec![]);
        let moved = io.prepare(false).unwrap().unwrap();

        assert!(moved.starts_with(job.join(STAGES_DIR).join(STALE_DIR)));
        assert_eq!(fs::read_to_string(moved.join("transcript.json")).unwrap(), "old");
        assert!(dir.is_dir());
        assert!(!dir.join("transcript.json").exists());

        // Retrying with the record still invalidated leaves the empty dir alone
        assert!(io.prepare(true).unwrap().is_none());
    }

    #[test]
    fn prepare_keeps_dir_on_first_attempt() {
        let tmp = tempdir().unwrap();
        let io = io_after(tmp.path(), "transcribe", "02_transcribe", vec![]);
        put(io.stage_dir(), "seed.json", "x");
        assert!(io.prepare(false).unwrap().is_none());
        assert!(io.stage_dir().join("seed.json").exists());
    }

    #[test]
    fn prepare_clears_partial_outputs_of_earlier_attempt() {
        let tmp = tempdir().unwrap();
        let io = io_after(tmp.path(), "transcribe", "02_transcribe", vec![]);
        put(io.stage_dir(), "transcript.json", "half");

        let moved = io.prepare(true).unwrap().unwrap();
        assert_eq!(fs::read_to_string(moved.join("transcript.json")).unwrap(), "half");
        assert!(io.output("transcript.json").is_none());
        assert!(io.stage_dir().is_dir());
    }
}
