//! Transcript artifact format.
//!
//! ```json
//! { "language": "ja", "segments": [ { "start": 1.2, "end": 3.4, "text": "...", "speaker": "S1" } ] }
//! ```
//!
//! Times are seconds from the start of the media. `translation.json` uses the
//! same shape with segments aligned by index to the transcript.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{read_json, write_json};
use crate::orchestrator::{StageError, StepResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
}

impl Segment {
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
            speaker: None,
        }
    }

    /// Seconds of overlap with `[start, end)`.
    pub fn overlap(&self, start: f64, end: f64) -> f64 {
        (self.end.min(end) - self.start.max(start)).max(0.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub segments: Vec<Segment>,
}

impl Transcript {
    pub fn load(path: &Path) -> StepResult<Self> {
        let transcript: Self = read_json(path)?;
        transcript.validate(path)?;
        Ok(transcript)
    }

    pub fn save(&self, path: &Path) -> StepResult<()> {
        write_json(path, self)
    }

    /// Segments must have finite, non-negative, non-inverted timing.
    fn validate(&self, path: &Path) -> StepResult<()> {
        for (i, seg) in self.segments.iter().enumerate() {
            let valid = seg.start.is_finite()
                && seg.end.is_finite()
                && seg.start >= 0.0
                && seg.end >= seg.start;
            if !valid {
                return Err(StageError::parse_error(
                    path.display().to_string(),
                    format!("segment {} has invalid timing {}..{}", i, seg.start, seg.end),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn overlap_is_clamped() {
        let seg = Segment::new(1.0, 3.0, "hi");
        assert_eq!(seg.overlap(2.0, 5.0), 1.0);
        assert_eq!(seg.overlap(4.0, 5.0), 0.0);
    }

    #[test]
    fn rejects_inverted_segments() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("transcript.json");
        std::fs::write(&path, r#"{"segments":[{"start":3.0,"end":1.0,"text":"x"}]}"#).unwrap();
        let err = Transcript::load(&path).unwrap_err();
        assert!(err.to_string().contains("invalid timing"));
    }

    #[test]
    fn speaker_is_optional() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("transcript.json");
        std::fs::write(&path, r#"{"language":"ja","segments":[{"start":0,"end":1.5,"text":"a"}]}"#)
            .unwrap();
        let t = Transcript::load(&path).unwrap();
        assert_eq!(t.language.as_deref(), Some("ja"));
        assert_eq!(t.segments[0].speaker, None);
    }
}
