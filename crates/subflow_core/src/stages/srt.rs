//! `format_subtitles`: render the final SRT file.
//!
//! Text comes from `translation.json` when present, else the transcript.
//! Lines are wrapped to `subtitles.max_line_length` characters and at most
//! `subtitles.max_lines` lines; lyric segments are wrapped in `<i>` tags.

use std::collections::HashSet;

use super::artifacts::{LYRICS_STYLES, SUBTITLES, TRANSCRIPT, TRANSLATION};
use super::lyrics::LyricsStyles;
use super::read_json;
use super::transcript::{Segment, Transcript};
use crate::atomic::write_atomic;
use crate::config::StageConfig;
use crate::orchestrator::{StageBody, StageError, StepResult};
use crate::stageio::StageIo;

pub struct FormatSubtitles;

impl StageBody for FormatSubtitles {
    fn run(&self, io: &StageIo, config: &StageConfig) -> StepResult<()> {
        let max_line_length = config.get_i64("subtitles.max_line_length")?.max(1) as usize;
        let max_lines = config.get_i64("subtitles.max_lines")?.max(1) as usize;

        let transcript = Transcript::load(&io.resolve_input(TRANSCRIPT, None)?)?;
        let segments = match io.resolve_optional(TRANSLATION) {
            Some(path) => {
                let translation = Transcript::load(&path)?;
                if translation.segments.len() != transcript.segments.len() {
                    tracing::warn!(
                        transcript = transcript.segments.len(),
                        translation = translation.segments.len(),
                        "Translation segment count differs from transcript"
                    );
                }
                translation.segments
            }
            None => transcript.segments,
        };

        let italic: HashSet<usize> = match io.resolve_optional(LYRICS_STYLES) {
            Some(path) => read_json::<LyricsStyles>(&path)?
                .italic_segments
                .into_iter()
                .collect(),
            None => HashSet::new(),
        };

        let srt = write_srt(&segments, &italic, max_line_length, max_lines);
        let path = io.write_output(SUBTITLES)?;
        write_atomic(&path, srt.as_bytes())
            .map_err(|e| StageError::io_error(format!("write {}", path.display()), e))
    }
}

/// Render segments as SRT. Empty segments are dropped and numbering stays
/// contiguous.
pub fn write_srt(
    segments: &[Segment],
    italic: &HashSet<usize>,
    max_line_length: usize,
    max_lines: usize,
) -> String {
    let mut output = String::new();
    let mut index = 0;

    for (i, seg) in segments.iter().enumerate() {
        let lines = wrap_text(seg.text.trim(), max_line_length, max_lines);
        if lines.is_empty() {
            continue;
        }
        if index > 0 {
            output.push('\n');
        }
        index += 1;

        output.push_str(&format!("{}\n", index));
        output.push_str(&format!(
            "{} --> {}\n",
            format_srt_time(seg.start * 1000.0),
            format_srt_time(seg.end * 1000.0)
        ));

        let text = lines.join("\n");
        if italic.contains(&i) {
            output.push_str(&format!("<i>{}</i>\n", text));
        } else {
            output.push_str(&text);
            output.push('\n');
        }
    }

    output
}

/// Format milliseconds as an SRT timestamp (HH:MM:SS,mmm).
pub fn format_srt_time(ms: f64) -> String {
    let ms = ms.round().max(0.0) as u64;

    let millis = ms % 1000;
    let total_secs = ms / 1000;
    let secs = total_secs % 60;
    let total_mins = total_secs / 60;
    let mins = total_mins % 60;
    let hours = total_mins / 60;

    format!("{:02}:{:02}:{:02},{:03}", hours, mins, secs, millis)
}

/// Greedy word wrap. Overflow beyond `max_lines` is appended to the last
/// line rather than dropped.
pub fn wrap_text(text: &str, max_line_length: usize, max_lines: usize) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        let fits = current.is_empty()
            || current.chars().count() + 1 + word.chars().count() <= max_line_length;
        if !fits && lines.len() + 1 < max_lines {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_srt_time() {
        assert_eq!(format_srt_time(0.0), "00:00:00,000");
        assert_eq!(format_srt_time(1500.0), "00:00:01,500");
        assert_eq!(format_srt_time(1234.5), "00:00:01,235");
        assert_eq!(format_srt_time(3_600_000.0), "01:00:00,000");
        assert_eq!(format_srt_time(-20.0), "00:00:00,000");
    }

    #[test]
    fn wraps_to_line_budget() {
        assert_eq!(
            wrap_text("the quick brown fox jumps", 10, 2),
            vec!["the quick", "brown fox jumps"]
        );
        assert_eq!(wrap_text("short", 42, 2), vec!["short"]);
        assert!(wrap_text("   ", 42, 2).is_empty());
    }

    #[test]
    fn writes_numbered_events_with_italics() {
        let segments = vec![
            Segment::new(1.0, 4.0, "Hello, world!"),
            Segment::new(4.5, 5.0, " "),
            Segment::new(5.0, 8.0, "La la la"),
        ];
        let italic: HashSet<usize> = [2].into_iter().collect();

        let output = write_srt(&segments, &italic, 42, 2);
        let expected = "1\n00:00:01,000 --> 00:00:04,000\nHello, world!\n\n2\n00:00:05,000 --> 00:00:08,000\n<i>La la la</i>\n";
        assert_eq!(output, expected);
    }
}
