//! Where each planned stage keeps its artifacts.

use std::path::{Path, PathBuf};

use super::error::{StageIoError, StageIoResult};
use super::resolver::StageIo;
use crate::jobs::{stage_dir_in, stage_dir_name, Manifest, INVALIDATED_MARKER};
use crate::models::StageStatus;

/// One stage's directory and whether its artifacts may be consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSlot {
    pub name: String,
    pub dir: PathBuf,
    /// Succeeded and not invalidated.
    pub usable: bool,
    pub invalidated: bool,
}

/// Stage directories of one job in execution order.
#[derive(Debug, Clone)]
pub struct StageLayout {
    job_dir: PathBuf,
    slots: Vec<StageSlot>,
}

impl StageLayout {
    /// Build from the plan order and the manifest's directory assignments.
    ///
    /// Stages without an assignment get their positional name.
    pub fn from_manifest(job_dir: &Path, order: &[String], manifest: &Manifest) -> Self {
        let slots = order
            .iter()
            .enumerate()
            .map(|(position, name)| {
                let record = manifest.record(name);
                let dir_name = record
                    .and_then(|r| r.output_dir.clone())
                    .unwrap_or_else(|| stage_dir_name(position, name));
                let dir = stage_dir_in(job_dir, &dir_name);
                let invalidated = record.map(|r| r.invalidated).unwrap_or(false)
                    || dir.join(INVALIDATED_MARKER).exists();
                let succeeded = record.map(|r| r.status) == Some(StageStatus::Succeeded);
                StageSlot {
                    name: name.clone(),
                    dir,
                    usable: succeeded && !invalidated,
                    invalidated,
                }
            })
            .collect();

        Self {
            job_dir: job_dir.to_path_buf(),
            slots,
        }
    }

    pub fn job_dir(&self) -> &Path {
        &self.job_dir
    }

    pub fn slots(&self) -> &[StageSlot] {
        &self.slots
    }

    pub fn slot(&self, stage: &str) -> Option<&StageSlot> {
        self.slots.iter().find(|s| s.name == stage)
    }

    /// Resolver for `stage`, seeing every stage planned before it.
    pub fn io_for(&self, stage: &str) -> StageIoResult<StageIo> {
        let position = self
            .slots
            .iter()
            .position(|s| s.name == stage)
            .ok_or_else(|| StageIoError::UnknownStage(stage.to_string()))?;
        let own = &self.slots[position];
        Ok(StageIo::new(
            &self.job_dir,
            stage,
            own.dir.clone(),
            own.invalidated,
            self.slots[..position].to_vec(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::TransitionDetails;

    fn succeeded(manifest: &mut Manifest, stage: &str) {
        manifest
            .apply(stage, StageStatus::Running, &TransitionDetails::none())
            .unwrap();
        manifest
            .apply(stage, StageStatus::Succeeded, &TransitionDetails::none())
            .unwrap();
    }

    #[test]
    fn assigned_directories_win_over_positions() {
        let mut m = Manifest::empty("job");
        m.ensure_record("transcribe").output_dir = Some("02_transcribe".into());
        let order = vec![
            "extract_audio".to_string(),
            "vocal_separation".to_string(),
            "transcribe".to_string(),
        ];
        let layout = StageLayout::from_manifest(Path::new("/j"), &order, &m);

        assert_eq!(layout.slot("transcribe").unwrap().dir, PathBuf::from("/j/stages/02_transcribe"));
        assert_eq!(
            layout.slot("vocal_separation").unwrap().dir,
            PathBuf::from("/j/stages/02_vocal_separation")
        );
    }

    #[test]
    fn only_succeeded_stages_are_usable() {
        let mut m = Manifest::empty("job");
        succeeded(&mut m, "a");
        m.apply("b", StageStatus::Running, &TransitionDetails::none()).unwrap();
        m.apply("b", StageStatus::Skipped, &TransitionDetails::error("x")).unwrap();
        succeeded(&mut m, "c");
        m.reset("c");

        let order = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let layout = StageLayout::from_manifest(Path::new("/j"), &order, &m);
        let usable: Vec<_> = layout.slots().iter().map(|s| s.usable).collect();
        assert_eq!(usable, vec![true, false, false]);
        assert!(layout.slot("c").unwrap().invalidated);
    }

    #[test]
    fn io_for_sees_only_earlier_stages() {
        let m = Manifest::empty("job");
        let order = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let layout = StageLayout::from_manifest(Path::new("/j"), &order, &m);
        let io = layout.io_for("b").unwrap();
        assert_eq!(io.predecessors().len(), 1);
        assert!(matches!(layout.io_for("zzz"), Err(StageIoError::UnknownStage(_))));
    }
}
