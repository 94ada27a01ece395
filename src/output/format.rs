//! # Output Formatting
//!
//! Pure rendering of transcription results.
//!
//! Same inputs always give the same bytes, so the output can be compared
//! against golden files.
//!
//! ## Formats:
//! - **txt**: the plain text, or one `[HH:MM:SS - HH:MM:SS]` block per segment
//!   when timestamps are on (optionally with the segment confidence)
//! - **json**: pretty printed, `{"text"}` or the full result with segments
//! - **srt**: numbered SubRip cues; requires segments
//!
//! ## Example (txt with timestamps and confidence):
//! ```text
//! [00:00:00 - 00:00:02] (confidence: 0.91)
//! hello
//!
//! [00:00:02 - 01:01:01] (confidence: 0.00)
//!  world
//! ```

use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::output::{OutputFormatOptions, OutputKind};
use crate::transcription::{Segment, TranscriptionResult};

/// Render `result` according to `options`.
///
/// ## Errors:
/// SRT needs timed segments. Asking for SRT on a result without segments is a
/// caller bug and comes back as `AppError::BadRequest`.
pub fn format(result: &TranscriptionResult, options: &OutputFormatOptions) -> AppResult<String> {
    match options.kind {
        OutputKind::Text => Ok(format_text(
            result,
            options.include_timestamps,
            options.include_confidence,
        )),
        OutputKind::Json => format_json(result, options.include_timestamps),
        OutputKind::Srt => format_srt(result),
    }
}

fn format_text(result: &TranscriptionResult, include_timestamps: bool, include_confidence: bool) -> String {
    let segments = match result.segments.as_deref() {
        Some(segments) if include_timestamps && !segments.is_empty() => segments,
        _ => return result.text.clone(),
    };

    segments
        .iter()
        .map(|segment| {
            let range = format!("[{} - {}]", clock(segment.start), clock(segment.end));
            if include_confidence {
                format!(
                    "{} (confidence: {:.2})\n{}\n",
                    range,
                    segment.confidence_or_zero(),
                    segment.text
                )
            } else {
                format!("{}\n{}\n", range, segment.text)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Serialize)]
struct TextOnly<'a> {
    text: &'a str,
}

/// serde_json's pretty printer indents with two spaces and writes non-ASCII
/// characters as-is. Field order follows the struct declaration.
fn format_json(result: &TranscriptionResult, include_timestamps: bool) -> AppResult<String> {
    let rendered = if include_timestamps {
        serde_json::to_string_pretty(result)
    } else {
        serde_json::to_string_pretty(&TextOnly { text: &result.text })
    };
    rendered.map_err(|e| AppError::Internal(format!("JSON rendering failed: {}", e)))
}

/// SubRip: 1-based cue numbers, `-->` time ranges, a blank line after each cue.
fn format_srt(result: &TranscriptionResult) -> AppResult<String> {
    let segments = result.segments.as_deref().ok_or_else(|| {
        AppError::BadRequest("SRT output requires timestamped segments".to_string())
    })?;

    Ok(segments
        .iter()
        .enumerate()
        .map(|(i, segment)| srt_block(i + 1, segment))
        .collect())
}

fn srt_block(index: usize, segment: &Segment) -> String {
    format!(
        "{}\n{} --> {}\n{}\n\n",
        index,
        srt_clock(segment.start),
        srt_clock(segment.end),
        segment.text
    )
}

/// `HH:MM:SS` through calendar time, so 24h and above wrap around.
fn clock(seconds: f64) -> String {
    // Negative offsets clamp to zero
    let whole = seconds.max(0.0).trunc() as i64;
    chrono::DateTime::from_timestamp(whole, 0)
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "00:00:00".to_string())
}

/// `HH:MM:SS,mmm`; milliseconds are truncated, not rounded.
fn srt_clock(seconds: f64) -> String {
    let seconds = seconds.max(0.0);
    let millis = ((seconds - seconds.trunc()) * 1000.0) as u32;
    format!("{},{:03}", clock(seconds), millis.min(999))
}
