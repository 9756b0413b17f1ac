//! `lyrics_styling`: decide which transcript segments render as song lyrics.

use serde::{Deserialize, Serialize};

use super::artifacts::{LYRICS, LYRICS_STYLES, TRANSCRIPT};
use super::transcript::Transcript;
use super::{read_json, write_json};
use crate::config::StageConfig;
use crate::orchestrator::{StageBody, StepResult};
use crate::stageio::StageIo;

const MIN_CONFIDENCE_KEY: &str = "lyrics.min_confidence";

/// A time range the detector believes is sung.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LyricSpan {
    pub start: f64,
    pub end: f64,
    pub confidence: f64,
}

/// Contents of `lyrics.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LyricsReport {
    #[serde(default)]
    pub spans: Vec<LyricSpan>,
}

/// Contents of `lyrics_styles.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LyricsStyles {
    pub min_confidence: f64,
    /// Transcript segment indices rendered in italics.
    pub italic_segments: Vec<usize>,
}

pub struct LyricsStyling;

impl LyricsStyling {
    /// A segment is a lyric when confident spans cover at least half of it.
    pub fn classify(transcript: &Transcript, report: &LyricsReport, min_confidence: f64) -> LyricsStyles {
        let confident: Vec<&LyricSpan> = report
            .spans
            .iter()
            .filter(|s| s.confidence >= min_confidence)
            .collect();

        let italic_segments = transcript
            .segments
            .iter()
            .enumerate()
            .filter(|(_, seg)| {
                let covered: f64 = confident.iter().map(|s| seg.overlap(s.start, s.end)).sum();
                covered > 0.0 && covered * 2.0 >= seg.end - seg.start
            })
            .map(|(i, _)| i)
            .collect();

        LyricsStyles {
            min_confidence,
            italic_segments,
        }
    }
}

impl StageBody for LyricsStyling {
    fn run(&self, io: &StageIo, config: &StageConfig) -> StepResult<()> {
        let min_confidence = config.get_f64(MIN_CONFIDENCE_KEY)?;
        let transcript = Transcript::load(&io.resolve_input(TRANSCRIPT, None)?)?;
        let report: LyricsReport = read_json(&io.resolve_input(LYRICS, None)?)?;

        let styles = Self::classify(&transcript, &report, min_confidence);
        tracing::debug!(lyrics = styles.italic_segments.len(), "Classified lyric segments");
        write_json(&io.write_output(LYRICS_STYLES)?, &styles)
    }
}
