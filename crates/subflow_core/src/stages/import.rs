//! `import_transcript`: bring an existing transcript into the job.

use super::artifacts::TRANSCRIPT;
use super::read_json;
use super::transcript::Transcript;
use crate::config::StageConfig;
use crate::jobs::{Job, JOB_FILE};
use crate::orchestrator::{StageBody, StageError, StepResult};
use crate::stageio::StageIo;

/// Copies the job's input transcript into `transcript.json`, validating it
/// on the way. The job's source language fills in a missing language tag.
pub struct ImportTranscript;

impl StageBody for ImportTranscript {
    fn run(&self, io: &StageIo, _config: &StageConfig) -> StepResult<()> {
        let job: Job = read_json(&io.job_dir().join(JOB_FILE))?;
        let source = job
            .transcript
            .as_ref()
            .ok_or_else(|| StageError::invalid_input("job has no input transcript"))?;
        if !source.is_file() {
            return Err(StageError::invalid_input(format!(
                "transcript not found: {}",
                source.display()
            )));
        }

        let mut transcript = Transcript::load(source)?;
        if transcript.language.is_none() {
            transcript.language = Some(job.languages.source.clone());
        }
        tracing::debug!(
            segments = transcript.segments.len(),
            "Imported transcript from {}",
            source.display()
        );
        transcript.save(&io.write_output(TRANSCRIPT)?)
    }
}
