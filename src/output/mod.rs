//! # Output Formatting
//!
//! Turns a raw [`TranscriptionResult`](crate::transcription::TranscriptionResult)
//! into the artifact the user asked for (plain text, JSON, or SRT subtitles) and
//! delivers it to a file or stdout.
//!
//! The options used for one request are always built by [`OutputFormatOptions::resolve`]:
//! configured defaults first, then per-call overrides. An override that was not
//! given is `None` and never counts as `false`.

pub mod delivery;
pub mod format;

pub use delivery::{deliver, kind_from_output_path, resolve_output_path, Destination};
pub use format::format;

use serde::{Deserialize, Serialize};

use crate::config::OutputFormatConfig;

/// Target representation of a transcript.
///
/// Serialized as the file extension (`txt`, `json`, `srt`). Unknown strings in a
/// config file fall back to `Text` rather than failing the whole load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OutputKind {
    Text,
    Json,
    Srt,
}

impl OutputKind {
    /// Strict parse, used for file extensions.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().trim_start_matches('.').to_lowercase().as_str() {
            "txt" | "text" => Some(OutputKind::Text),
            "json" => Some(OutputKind::Json),
            "srt" => Some(OutputKind::Srt),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputKind::Text => "txt",
            OutputKind::Json => "json",
            OutputKind::Srt => "srt",
        }
    }
}

impl From<String> for OutputKind {
    fn from(value: String) -> Self {
        OutputKind::parse(&value).unwrap_or_else(|| {
            tracing::warn!(requested = %value, "Unknown output format, using txt");
            OutputKind::Text
        })
    }
}

impl From<OutputKind> for String {
    fn from(kind: OutputKind) -> Self {
        kind.extension().to_string()
    }
}

impl std::fmt::Display for OutputKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Per-call overrides coming from the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatOverrides {
    pub kind: Option<OutputKind>,
    pub include_timestamps: Option<bool>,
    pub include_confidence: Option<bool>,
}

/// Fully resolved rendering options for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputFormatOptions {
    pub kind: OutputKind,
    pub include_timestamps: bool,
    pub include_confidence: bool,
}

impl OutputFormatOptions {
    /// Merge configured defaults with explicit overrides; overrides always win.
    pub fn resolve(defaults: &OutputFormatConfig, overrides: &FormatOverrides) -> Self {
        Self {
            kind: overrides.kind.unwrap_or(defaults.kind),
            include_timestamps: overrides
                .include_timestamps
                .unwrap_or(defaults.include_timestamps),
            include_confidence: overrides
                .include_confidence
                .unwrap_or(defaults.include_confidence),
        }
    }
}
