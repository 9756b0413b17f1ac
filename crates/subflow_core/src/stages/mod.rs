//! Bodies of the built-in in-process stages.
//!
//! Heavy stages (recognition, separation, translation) run in their own
//! runtimes through subprocess contexts. The stages here only reshape JSON
//! artifacts and render the final subtitle file.

mod import;
mod lyrics;
mod speakers;
mod srt;
mod transcript;

use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::atomic::write_atomic;
use crate::orchestrator::{StageBody, StageError, StepResult};

pub use import::ImportTranscript;
pub use lyrics::{LyricSpan, LyricsReport, LyricsStyles, LyricsStyling};
pub use speakers::{SpeakerLabels, SpeakerTurn, SpeakerTurns};
pub use srt::{format_srt_time, wrap_text, write_srt, FormatSubtitles};
pub use transcript::{Segment, Transcript};

/// Artifact names shared by the in-process stages.
pub mod artifacts {
    pub const TRANSCRIPT: &str = "transcript.json";
    pub const TRANSLATION: &str = "translation.json";
    pub const SPEAKERS: &str = "speakers.json";
    pub const LYRICS: &str = "lyrics.json";
    pub const LYRICS_STYLES: &str = "lyrics_styles.json";
    pub const SUBTITLES: &str = "subtitles.srt";
}

/// Stage name and body of every built-in in-process stage.
pub fn builtin_bodies() -> Vec<(&'static str, Arc<dyn StageBody>)> {
    vec![
        ("import_transcript", Arc::new(ImportTranscript) as Arc<dyn StageBody>),
        ("speaker_labels", Arc::new(SpeakerLabels) as Arc<dyn StageBody>),
        ("lyrics_styling", Arc::new(LyricsStyling) as Arc<dyn StageBody>),
        ("format_subtitles", Arc::new(FormatSubtitles) as Arc<dyn StageBody>),
    ]
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> StepResult<T> {
    let bytes = std::fs::read(path)
        .map_err(|e| StageError::io_error(format!("read {}", path.display()), e))?;
    serde_json::from_slice(&bytes).map_err(|e| StageError::parse_error(path.display().to_string(), e))
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> StepResult<()> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| StageError::other(format!("serialize {}: {}", path.display(), e)))?;
    write_atomic(path, &json).map_err(|e| StageError::io_error(format!("write {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::InProcessContext;
    use crate::planner::{builtin_registry, IN_PROCESS};

    #[test]
    fn every_in_process_stage_has_a_body() {
        let context = InProcessContext::builtin();
        for def in builtin_registry().stages() {
            if def.context == IN_PROCESS {
                assert!(context.has_body(&def.name), "{}", def.name);
            }
        }
    }
}
