//! `speaker_labels`: attach diarization speakers to transcript segments.

use serde::{Deserialize, Serialize};

use super::artifacts::{SPEAKERS, TRANSCRIPT};
use super::read_json;
use super::transcript::Transcript;
use crate::config::StageConfig;
use crate::orchestrator::{StageBody, StepResult};
use crate::stageio::StageIo;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerTurn {
    pub start: f64,
    pub end: f64,
    pub speaker: String,
}

/// Contents of `speakers.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeakerTurns {
    #[serde(default)]
    pub turns: Vec<SpeakerTurn>,
}

pub struct SpeakerLabels;

impl SpeakerLabels {
    /// Give each segment the speaker whose turns overlap it most.
    /// Segments overlapping no turn keep their existing label.
    pub fn assign(transcript: &mut Transcript, turns: &SpeakerTurns) -> usize {
        let mut labelled = 0;
        for seg in &mut transcript.segments {
            let mut best: Option<(&str, f64)> = None;
            for turn in &turns.turns {
                let overlap = seg.overlap(turn.start, turn.end);
                if overlap <= 0.0 {
                    continue;
                }
                match best {
                    Some((_, b)) if overlap <= b => {}
                    _ => best = Some((turn.speaker.as_str(), overlap)),
                }
            }
            if let Some((speaker, _)) = best {
                seg.speaker = Some(speaker.to_string());
                labelled += 1;
            }
        }
        labelled
    }
}

impl StageBody for SpeakerLabels {
    fn run(&self, io: &StageIo, _config: &StageConfig) -> StepResult<()> {
        let mut transcript = Transcript::load(&io.resolve_input(TRANSCRIPT, None)?)?;
        let turns: SpeakerTurns = read_json(&io.resolve_input(SPEAKERS, None)?)?;

        let labelled = Self::assign(&mut transcript, &turns);
        tracing::debug!(
            labelled,
            total = transcript.segments.len(),
            "Assigned speakers"
        );
        transcript.save(&io.write_output(TRANSCRIPT)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::Segment;

    fn turn(start: f64, end: f64, speaker: &str) -> SpeakerTurn {
        SpeakerTurn {
            start,
            end,
            speaker: speaker.into(),
        }
    }

    #[test]
    fn picks_speaker_with_largest_overlap() {
        let mut transcript = Transcript {
            language: None,
            segments: vec![
                Segment::new(0.0, 4.0, "first"),
                Segment::new(10.0, 12.0, "silence gap"),
            ],
        };
        let turns = SpeakerTurns {
            turns: vec![turn(0.0, 1.0, "A"), turn(1.0, 4.0, "B")],
        };

        let labelled = SpeakerLabels::assign(&mut transcript, &turns);
        assert_eq!(labelled, 1);
        assert_eq!(transcript.segments[0].speaker.as_deref(), Some("B"));
        assert_eq!(transcript.segments[1].speaker, None);
    }
}
