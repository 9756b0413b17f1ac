//! Core enums used throughout the orchestrator.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which end-to-end workflow a job runs.
///
/// The mode selects the mandatory base sequence of stages. It is locked
/// once the first stage of a job has executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowMode {
    /// Extract audio, transcribe, format subtitles.
    TranscribeOnly,
    /// Import an existing transcript, translate, format subtitles.
    TranslateOnly,
    /// Extract, transcribe, translate and format.
    FullPipeline,
    /// Re-render subtitles from an imported transcript.
    FormatOnly,
}

impl WorkflowMode {
    /// Get the canonical (CLI / on-disk) name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TranscribeOnly => "transcribe-only",
            Self::TranslateOnly => "translate-only",
            Self::FullPipeline => "full-pipeline",
            Self::FormatOnly => "format-only",
        }
    }

    /// Get all modes.
    pub fn all() -> &'static [WorkflowMode] {
        &[
            Self::TranscribeOnly,
            Self::TranslateOnly,
            Self::FullPipeline,
            Self::FormatOnly,
        ]
    }

    /// Whether the mode needs a target language.
    pub fn needs_target_language(&self) -> bool {
        matches!(self, Self::TranslateOnly | Self::FullPipeline)
    }
}

impl std::fmt::Display for WorkflowMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown workflow mode '{}'", s))
    }
}

/// Named feature toggle gating an optional stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    VocalSeparation,
    Diarization,
    SpeakerLabels,
    LyricsDetection,
    LyricsStyling,
    VisionAnalysis,
    MetadataLookup,
    Glossary,
    EntityCorrection,
}

impl Feature {
    /// Get the canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VocalSeparation => "vocal_separation",
            Self::Diarization => "diarization",
            Self::SpeakerLabels => "speaker_labels",
            Self::LyricsDetection => "lyrics_detection",
            Self::LyricsStyling => "lyrics_styling",
            Self::VisionAnalysis => "vision_analysis",
            Self::MetadataLookup => "metadata_lookup",
            Self::Glossary => "glossary",
            Self::EntityCorrection => "entity_correction",
        }
    }

    /// Get all features.
    pub fn all() -> &'static [Feature] {
        &[
            Self::VocalSeparation,
            Self::Diarization,
            Self::SpeakerLabels,
            Self::LyricsDetection,
            Self::LyricsStyling,
            Self::VisionAnalysis,
            Self::MetadataLookup,
            Self::Glossary,
            Self::EntityCorrection,
        ]
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Accept camelCase spellings too ("lyricsDetection")
        let normalized: String = s
            .chars()
            .flat_map(|c| {
                if c.is_ascii_uppercase() {
                    vec!['_', c.to_ascii_lowercase()]
                } else if c == '-' {
                    vec!['_']
                } else {
                    vec![c]
                }
            })
            .collect();
        let normalized = normalized.trim_start_matches('_');
        Self::all()
            .iter()
            .copied()
            .find(|f| f.as_str() == normalized)
            .ok_or_else(|| format!("unknown feature '{}'", s))
    }
}

/// Status of one stage execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Check whether the dispatcher may move a record from `self` to `next`.
    ///
    /// Forced re-runs go through `Manifest::reset` and are not covered here.
    pub fn can_transition_to(&self, next: StageStatus) -> bool {
        use StageStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            // A retry re-enters running with the attempt count bumped
            (Running, Running) => true,
            (Running, Succeeded | Failed | Skipped) => true,
            // Interrupted attempt hands the stage back
            (Running, Pending) => true,
            // Resume retries failed and degraded stages
            (Failed | Skipped, Running) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job-level status driven by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    NotStarted,
    Running,
    Completed,
    Failed,
    /// Stopped at a stage boundary; resumable.
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_through_str() {
        for mode in WorkflowMode::all() {
            assert_eq!(mode.as_str().parse::<WorkflowMode>().unwrap(), *mode);
        }
        assert!("everything".parse::<WorkflowMode>().is_err());
    }

    #[test]
    fn mode_serializes_kebab_case() {
        let json = serde_json::to_string(&WorkflowMode::TranslateOnly).unwrap();
        assert_eq!(json, "\"translate-only\"");
    }

    #[test]
    fn feature_parses_camel_case() {
        assert_eq!(
            "lyricsDetection".parse::<Feature>().unwrap(),
            Feature::LyricsDetection
        );
        assert_eq!(
            "entity-correction".parse::<Feature>().unwrap(),
            Feature::EntityCorrection
        );
    }

    #[test]
    fn status_transitions_are_monotonic() {
        use StageStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Skipped));
        assert!(!Succeeded.can_transition_to(Running));
        assert!(!Succeeded.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Succeeded));
        assert!(Failed.can_transition_to(Running));
    }
}
