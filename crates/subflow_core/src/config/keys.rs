//! Declared configuration keys with types and defaults.
//!
//! Stages used to read ad hoc environment flags; every tunable now has
//! an entry here so it can be type-checked before any stage runs.

/// Type of a declared key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    String,
    Bool,
    Integer,
    Number,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Bool => "bool",
            Self::Integer => "integer",
            Self::Number => "number",
        }
    }
}

/// Compile-time default for a declared key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DefaultValue {
    Str(&'static str),
    Bool(bool),
    Integer(i64),
    Number(f64),
}

/// A declared configuration key.
#[derive(Debug, Clone, Copy)]
pub struct ConfigKey {
    pub name: &'static str,
    pub kind: ValueKind,
    /// `None` means callers must supply a fallback or handle `ConfigMissing`.
    pub default: Option<DefaultValue>,
    pub description: &'static str,
}

const fn key(
    name: &'static str,
    kind: ValueKind,
    default: Option<DefaultValue>,
    description: &'static str,
) -> ConfigKey {
    ConfigKey {
        name,
        kind,
        default,
        description,
    }
}

pub const RETRY_MAX_ATTEMPTS: &str = "retry.max_attempts";
pub const RETRY_BACKOFF_MS: &str = "retry.backoff_ms";
pub const STAGE_TIMEOUT_SECS: &str = "stage.timeout_secs";

/// Every key the orchestrator and built-in stages know about.
pub static DECLARED_KEYS: &[ConfigKey] = &[
    key(
        RETRY_MAX_ATTEMPTS,
        ValueKind::Integer,
        None,
        "Attempts for retryable stages (overrides the stage definition)",
    ),
    key(
        RETRY_BACKOFF_MS,
        ValueKind::Integer,
        Some(DefaultValue::Integer(1000)),
        "Delay between attempts of a retryable stage",
    ),
    key(
        STAGE_TIMEOUT_SECS,
        ValueKind::Integer,
        None,
        "Wall-clock limit enforced by the execution context",
    ),
    key(
        "audio.sample_rate",
        ValueKind::Integer,
        Some(DefaultValue::Integer(16000)),
        "Sample rate of the extracted audio track",
    ),
    key(
        "whisper.model",
        ValueKind::String,
        Some(DefaultValue::Str("large-v3")),
        "Speech recognition model",
    ),
    key(
        "whisper.beam_size",
        ValueKind::Integer,
        Some(DefaultValue::Integer(5)),
        "Beam width for decoding",
    ),
    key(
        "whisper.vad_filter",
        ValueKind::Bool,
        Some(DefaultValue::Bool(true)),
        "Drop non-speech regions before recognition",
    ),
    key(
        "diarization.max_speakers",
        ValueKind::Integer,
        Some(DefaultValue::Integer(8)),
        "Upper bound on detected speakers",
    ),
    key(
        "lyrics.min_confidence",
        ValueKind::Number,
        Some(DefaultValue::Number(0.6)),
        "Minimum score for a segment to be treated as lyrics",
    ),
    key(
        "translate.provider",
        ValueKind::String,
        Some(DefaultValue::Str("llm")),
        "Translation backend",
    ),
    key(
        "translate.batch_size",
        ValueKind::Integer,
        Some(DefaultValue::Integer(20)),
        "Segments per translation request",
    ),
    key(
        "metadata.api_key",
        ValueKind::String,
        None,
        "Movie database API key",
    ),
    key(
        "subtitles.max_line_length",
        ValueKind::Integer,
        Some(DefaultValue::Integer(42)),
        "Characters per subtitle line",
    ),
    key(
        "subtitles.max_lines",
        ValueKind::Integer,
        Some(DefaultValue::Integer(2)),
        "Lines per subtitle event",
    ),
];

/// Look up a declared key by name.
pub fn find(name: &str) -> Option<&'static ConfigKey> {
    DECLARED_KEYS.iter().find(|k| k.name == name)
}
