//! One-shot local transcription: load the model in this process, transcribe a
//! single file, and exit. Nothing is shared with the background service.

use std::path::{Path, PathBuf};

use crate::client::Spinner;
use crate::config::AppConfig;
use crate::device;
use crate::error::{AppError, AppResult};
use crate::transcription::{ModelSize, TranscriptionEngine, TranscriptionResult};

/// Transcribe `input` with a freshly loaded model. `model` overrides the configured size.
pub async fn transcribe(
    config: &AppConfig,
    input: &Path,
    language: &str,
    model: Option<&str>,
    show_progress: bool,
) -> AppResult<TranscriptionResult> {
    if !input.is_file() {
        return Err(AppError::InputNotFound(input.display().to_string()));
    }
    let size: ModelSize = model
        .unwrap_or(&config.model)
        .parse()
        .map_err(|e: anyhow::Error| AppError::ConfigError(e.to_string()))?;

    let device_preference = config.device.clone();
    let input: PathBuf = input.to_path_buf();
    let language = language.to_string();

    tokio::task::spawn_blocking(move || {
        let device = device::select_device(&device_preference);
        tracing::info!(model = %size, device = device::describe(&device), "Loading model");
        let engine = TranscriptionEngine::load(size, device)?;
        transcribe_with(&engine, &input, &language, show_progress)
    })
    .await
    .map_err(|e| AppError::Internal(format!("local transcription task failed: {}", e)))?
}

/// Blocking part of a local run, with the spinner up for exactly the inference call.
fn transcribe_with(
    engine: &TranscriptionEngine,
    input: &Path,
    language: &str,
    show_progress: bool,
) -> AppResult<TranscriptionResult> {
    let _spinner = Spinner::start("Transcribing...", show_progress);
    engine.transcribe(input, language)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::engine::fakes::{hello_world, scratch_media, ScriptedRecognizer};

    #[test]
    fn test_local_run_keeps_segments() {
        let engine = TranscriptionEngine::new(Box::new(ScriptedRecognizer::returning(hello_world())));
        let result = transcribe_with(&engine, scratch_media().path(), "uk", false).unwrap();
        assert_eq!(result, hello_world());
    }

    #[test]
    fn test_local_engine_failure_propagates() {
        let engine = TranscriptionEngine::new(Box::new(ScriptedRecognizer::failing("out of memory")));
        let err = transcribe_with(&engine, scratch_media().path(), "uk", false).unwrap_err();
        assert_eq!(err.kind(), "engine_failure");
    }

    #[tokio::test]
    async fn test_missing_input_fails_before_loading() {
        let err = transcribe(
            &AppConfig::default(),
            Path::new("/definitely/not/here.mp3"),
            "uk",
            None,
            false,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "input_not_found");
    }

    #[tokio::test]
    async fn test_unknown_model_override_is_rejected() {
        let media = scratch_media();
        let err = transcribe(&AppConfig::default(), media.path(), "uk", Some("gigantic"), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "config_error");
    }
}
