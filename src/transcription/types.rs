use serde::{Deserialize, Serialize};

/// Result of transcribing one media file.
///
/// This is also the wire format returned by the service's `/transcribe`
/// endpoint. `segments` is only present when timing was requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionResult {
    /// The full transcript; empty when no speech was detected
    pub text: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<Segment>>,
}

/// One timed stretch of speech.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Start time in seconds
    pub start: f64,
    /// End time in seconds
    pub end: f64,
    pub text: String,
    /// Mean token probability in [0, 1], when the engine reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl Segment {
    pub fn confidence_or_zero(&self) -> f64 {
        self.confidence.unwrap_or(0.0)
    }
}

impl TranscriptionResult {
    /// Drop timing information, keeping only the text.
    pub fn without_segments(self) -> Self {
        Self {
            text: self.text,
            segments: None,
        }
    }
}
