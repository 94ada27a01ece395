//! # Transcription Engine
//!
//! The adapter every caller goes through to reach the speech model. It owns the
//! loaded recognizer for the lifetime of the process and makes sure only one
//! inference runs at a time.
//!
//! ## Key Responsibilities:
//! - **Load once**: the model is built in [`TranscriptionEngine::load`] and never reloaded
//! - **Preconditions**: a missing input file is `InputNotFound`, checked before inference
//! - **Single-flight**: the recognizer sits behind a mutex; the underlying model is not re-entrant
//! - **Opaque failures**: whatever the recognizer reports becomes `EngineFailure`
//! - **Performance monitoring**: request counts and processing time for the health endpoint

use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use candle_core::Device;

use crate::error::{AppError, AppResult};
use crate::transcription::model::{ModelSize, WhisperModel};
use crate::transcription::TranscriptionResult;

/// A loaded speech model that can turn a media file into timed text.
///
/// Implementations may keep mutable decoder state between calls, hence `&mut self`.
pub trait SpeechRecognizer: Send {
    /// Name of the loaded model, for logs and the health endpoint.
    fn model_name(&self) -> String;

    /// Transcribe the file at `path`. Always returns segments when the model can time them.
    fn recognize(&mut self, path: &Path, language: &str) -> anyhow::Result<TranscriptionResult>;
}

/// Performance tracking for the transcription engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct EngineStats {
    /// Total number of transcription requests that reached the model
    pub total_requests: u64,

    /// Number of those that failed inside the model
    pub failed_requests: u64,

    /// Total processing time (milliseconds)
    pub total_processing_ms: u64,
}

impl EngineStats {
    pub fn average_processing_ms(&self) -> u64 {
        if self.total_requests > 0 {
            self.total_processing_ms / self.total_requests
        } else {
            0
        }
    }
}

pub struct TranscriptionEngine {
    recognizer: Mutex<Box<dyn SpeechRecognizer>>,
    model_name: String,
    stats: Mutex<EngineStats>,
}

impl TranscriptionEngine {
    pub fn new(recognizer: Box<dyn SpeechRecognizer>) -> Self {
        let model_name = recognizer.model_name();
        Self {
            recognizer: Mutex::new(recognizer),
            model_name,
            stats: Mutex::new(EngineStats::default()),
        }
    }

    /// Load the Whisper model of the given size onto `device`.
    ///
    /// This downloads weights on first use and takes seconds; call it once per
    /// process, from a blocking context.
    pub fn load(size: ModelSize, device: Device) -> AppResult<Self> {
        tracing::info!(model = %size, "Loading model for transcription engine");
        let start_time = Instant::now();

        let model = WhisperModel::load(size, device)
            .map_err(|e| AppError::EngineFailure(format!("model load failed: {:#}", e)))?;

        tracing::info!(
            model = %size,
            seconds = start_time.elapsed().as_secs_f64(),
            "Model loaded"
        );
        Ok(Self::new(Box::new(model)))
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Transcribe a file into a [`TranscriptionResult`].
    ///
    /// ## Process:
    /// 1. Check that `path` names an existing file
    /// 2. Wait for exclusive access to the recognizer
    /// 3. Run inference (blocking, proportional to media duration)
    /// 4. Record performance metrics
    ///
    /// Call from a blocking context (`web::block`, `spawn_blocking`).
    pub fn transcribe(&self, path: &Path, language: &str) -> AppResult<TranscriptionResult> {
        if !path.is_file() {
            return Err(AppError::InputNotFound(path.display().to_string()));
        }

        let mut recognizer = self
            .recognizer
            .lock()
            .map_err(|_| AppError::EngineFailure("engine is unusable after an earlier crash".to_string()))?;

        tracing::debug!(path = %path.display(), language, "Starting transcription");
        let start_time = Instant::now();
        let outcome = recognizer.recognize(path, language);
        drop(recognizer);
        let processing_ms = start_time.elapsed().as_millis() as u64;

        self.record(processing_ms, outcome.is_err());

        match outcome {
            Ok(result) => {
                tracing::info!(
                    chars = result.text.len(),
                    segments = result.segments.as_ref().map_or(0, |s| s.len()),
                    processing_ms,
                    "Transcription completed"
                );
                Ok(result)
            }
            Err(e) => {
                tracing::error!(error = %format!("{:#}", e), processing_ms, "Transcription failed");
                Err(AppError::EngineFailure(format!("{:#}", e)))
            }
        }
    }

    fn record(&self, processing_ms: u64, failed: bool) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.total_requests += 1;
            stats.total_processing_ms += processing_ms;
            if failed {
                stats.failed_requests += 1;
            }
        }
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.lock().map(|s| *s).unwrap_or_default()
    }
}
