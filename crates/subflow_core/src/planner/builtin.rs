//! Stage catalogue of the media subtitle workflow.

use super::registry::{Fallback, Idempotency, StageDefinition, StageRegistry};
use crate::models::{Feature, WorkflowMode};

/// Context id of stages whose bodies run inside the orchestrator process.
pub const IN_PROCESS: &str = "in-process";

const AUDIO_MODES: &[WorkflowMode] = &[WorkflowMode::TranscribeOnly, WorkflowMode::FullPipeline];
const IMPORT_MODES: &[WorkflowMode] = &[WorkflowMode::TranslateOnly, WorkflowMode::FormatOnly];
const ANALYSIS_MODES: &[WorkflowMode] = &[
    WorkflowMode::TranscribeOnly,
    WorkflowMode::TranslateOnly,
    WorkflowMode::FullPipeline,
];
const TRANSLATE_MODES: &[WorkflowMode] = &[WorkflowMode::TranslateOnly, WorkflowMode::FullPipeline];

/// Registry with every built-in stage and the four mode sequences.
pub fn builtin_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    for def in builtin_stages() {
        // Names below are unique
        let _ = registry.register(def);
    }

    registry.set_base(
        WorkflowMode::TranscribeOnly,
        &["extract_audio", "transcribe", "format_subtitles"],
    );
    registry.set_base(
        WorkflowMode::TranslateOnly,
        &["import_transcript", "translate", "format_subtitles"],
    );
    registry.set_base(
        WorkflowMode::FullPipeline,
        &["extract_audio", "transcribe", "translate", "format_subtitles"],
    );
    registry.set_base(
        WorkflowMode::FormatOnly,
        &["import_transcript", "format_subtitles"],
    );
    registry
}

fn builtin_stages() -> Vec<StageDefinition> {
    vec![
        StageDefinition::new("extract_audio", 10, "ffmpeg")
            .output("audio.wav")
            .modes(AUDIO_MODES),
        StageDefinition::new("import_transcript", 15, IN_PROCESS)
            .output("transcript.json")
            .idempotency(Idempotency::RerunSafe)
            .modes(IMPORT_MODES),
        StageDefinition::new("vocal_separation", 20, "demucs")
            .input("audio.wav")
            .output("vocals.wav")
            .optional()
            .feature(Feature::VocalSeparation)
            .modes(AUDIO_MODES),
        StageDefinition::new("transcribe", 30, "whisper")
            .input("audio.wav")
            .optional_input("vocals.wav")
            .output("transcript.json")
            .retryable(3, Fallback::Fatal)
            .modes(AUDIO_MODES),
        StageDefinition::new("diarize", 40, "pyannote")
            .input("audio.wav")
            .output("speakers.json")
            .optional()
            .feature(Feature::Diarization)
            .modes(AUDIO_MODES),
        StageDefinition::new("speaker_labels", 45, IN_PROCESS)
            .input("transcript.json")
            .input("speakers.json")
            .output("transcript.json")
            .optional()
            .idempotency(Idempotency::RerunSafe)
            .feature(Feature::SpeakerLabels)
            .modes(AUDIO_MODES),
        StageDefinition::new("lyrics_detection", 50, "whisper")
            .input("transcript.json")
            .optional_input("audio.wav")
            .output("lyrics.json")
            .optional()
            .feature(Feature::LyricsDetection)
            .modes(ANALYSIS_MODES),
        StageDefinition::new("lyrics_styling", 55, IN_PROCESS)
            .input("lyrics.json")
            .input("transcript.json")
            .output("lyrics_styles.json")
            .optional()
            .idempotency(Idempotency::RerunSafe)
            .feature(Feature::LyricsStyling)
            .requires("lyrics_detection")
            .modes(ANALYSIS_MODES),
        StageDefinition::new("vision_analysis", 60, "vision")
            .output("scene_context.json")
            .optional()
            .feature(Feature::VisionAnalysis)
            .modes(ANALYSIS_MODES),
        StageDefinition::new("metadata_lookup", 65, "network")
            .output("movie_metadata.json")
            .retryable(2, Fallback::Optional)
            .feature(Feature::MetadataLookup)
            .modes(ANALYSIS_MODES),
        StageDefinition::new("glossary_lookup", 70, "network")
            .optional_input("movie_metadata.json")
            .output("glossary.json")
            .optional()
            .feature(Feature::Glossary)
            .modes(ANALYSIS_MODES),
        StageDefinition::new("entity_correction", 75, "llm")
            .input("transcript.json")
            .optional_input("glossary.json")
            .optional_input("movie_metadata.json")
            .output("transcript.json")
            .optional()
            .feature(Feature::EntityCorrection)
            .modes(ANALYSIS_MODES),
        StageDefinition::new("translate", 80, "llm")
            .input("transcript.json")
            .optional_input("lyrics.json")
            .optional_input("glossary.json")
            .optional_input("scene_context.json")
            .output("translation.json")
            .retryable(3, Fallback::Fatal)
            .modes(TRANSLATE_MODES),
        StageDefinition::new("format_subtitles", 90, IN_PROCESS)
            .input("transcript.json")
            .optional_input("translation.json")
            .optional_input("lyrics_styles.json")
            .promoted_output("subtitles.srt")
            .idempotency(Idempotency::RerunSafe),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_is_valid() {
        builtin_registry().validate().unwrap();
    }

    #[test]
    fn every_feature_gates_exactly_one_stage() {
        let registry = builtin_registry();
        for feature in Feature::all() {
            let gated: Vec<_> = registry
                .stages()
                .iter()
                .filter(|s| s.feature == Some(*feature))
                .collect();
            assert_eq!(gated.len(), 1, "{feature}");
        }
    }

    #[test]
    fn every_mode_has_a_base_sequence() {
        let registry = builtin_registry();
        for mode in WorkflowMode::all() {
            assert!(!registry.base_sequence(*mode).is_empty(), "{mode}");
            assert_eq!(
                registry.base_sequence(*mode).last().map(String::as_str),
                Some("format_subtitles")
            );
        }
    }
}
