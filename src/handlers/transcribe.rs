//! # Transcription Endpoint
//!
//! `POST /transcribe`: upload a media file, get a transcript back.
//!
//! ## Upload lifecycle:
//! The multipart body is streamed chunk by chunk into a scratch file under the
//! system temp directory. The decoder needs a real path (and the extension as a
//! format hint), so the upload never lives only in memory.
//!
//! ## Rust Concepts:
//! - **Drop-based cleanup**: [`StagedUpload`] owns a `NamedTempFile`, so every exit
//!   path (success, engine error, broken upload, `?`) removes the file
//! - **`web::block`**: inference is CPU/GPU bound and runs off the async workers
//! - **Double `?`**: the first unwraps the thread pool result, the second the engine result

use std::path::{Path, PathBuf};

use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpResponse};
use futures_util::stream::StreamExt;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, AppResult};
use crate::state::ServiceState;

/// Transcribe an uploaded media file.
///
/// ## Request:
/// Multipart form data:
/// - `file`: the media file (required)
/// - `language`: locale code, defaults to the configured language
/// - `timestamps`: `true` to include timed segments, defaults to `false`
///
/// ## Response:
/// ```json
/// { "text": "hello world", "segments": [{ "start": 0.0, "end": 1.2, "text": "hello world", "confidence": 0.91 }] }
/// ```
/// `segments` is omitted unless `timestamps` was true.
///
/// ## Process:
/// 1. Refuse with 503 until the model is loaded
/// 2. Mark the service as busy so the watchdog leaves it alone
/// 3. Stream the upload to a private scratch file
/// 4. Run inference on the blocking thread pool; one inference at a time
/// 5. Remove the scratch file, whatever the outcome
pub async fn transcribe(state: web::Data<ServiceState>, mut payload: Multipart) -> AppResult<HttpResponse> {
    // Refused before any of the body is read
    let engine = state
        .engine()
        .ok_or_else(|| AppError::NotReady("the model is not loaded yet".to_string()))?;
    // Held until the response is built, so the watchdog sees the request as busy
    let _in_flight = state.activity.begin_request();

    let form = TranscribeForm::read(&mut payload).await?;
    let upload = form
        .file
        .ok_or_else(|| AppError::BadRequest("missing 'file' field".to_string()))?;
    // An empty language field means "use the default", same as a missing one
    let language = form
        .language
        .filter(|l| !l.trim().is_empty())
        .unwrap_or_else(|| state.config.language.clone());

    tracing::info!(
        file = %upload.original_name,
        bytes = upload.size,
        language = %language,
        timestamps = form.timestamps,
        "Transcription requested"
    );

    let path = upload.path().to_path_buf();
    let result = web::block(move || engine.transcribe(&path, &language))
        .await
        .map_err(|e| AppError::Internal(format!("worker pool: {}", e)))??;
    // Inference is done with the file
    drop(upload);

    let result = if form.timestamps {
        result
    } else {
        result.without_segments()
    };
    Ok(HttpResponse::Ok().json(result))
}

#[derive(Default)]
struct TranscribeForm {
    file: Option<StagedUpload>,
    language: Option<String>,
    timestamps: bool,
}

impl TranscribeForm {
    async fn read(payload: &mut Multipart) -> AppResult<Self> {
        let mut form = TranscribeForm::default();

        while let Some(item) = payload.next().await {
            let mut field: Field =
                item.map_err(|e| AppError::BadRequest(format!("Multipart error: {}", e)))?;

            let disposition = field
                .content_disposition()
                .ok_or_else(|| AppError::BadRequest("Missing content disposition".to_string()))?;
            let name = disposition
                .get_name()
                .ok_or_else(|| AppError::BadRequest("Missing field name".to_string()))?
                .to_string();
            let filename = disposition.get_filename().map(|s| s.to_string());

            match name.as_str() {
                "file" => {
                    let upload = StagedUpload::create(filename.as_deref().unwrap_or("upload"))?;
                    form.file = Some(upload.fill(&mut field).await?);
                }
                "language" => form.language = Some(read_text(&mut field).await?),
                "timestamps" => form.timestamps = parse_flag(&read_text(&mut field).await?)?,
                other => {
                    // Accepted for compatibility, not used
                    tracing::debug!(field = other, "Ignoring form field");
                    drain(&mut field).await?;
                }
            }
        }

        Ok(form)
    }
}

/// An uploaded file written to a private scratch file.
///
/// The `NamedTempFile` deletes the file when the upload is dropped, whether
/// inference succeeded, failed, or the upload itself broke off.
struct StagedUpload {
    file: NamedTempFile,
    original_name: String,
    size: u64,
}

impl StagedUpload {
    /// Scratch file named `upload-<random>-<base name>`. Keeping the client's
    /// base name keeps its extension, which the decoder uses as a format hint.
    /// Directory parts are stripped.
    fn create(client_name: &str) -> AppResult<Self> {
        let dir = upload_dir();
        std::fs::create_dir_all(&dir)?;

        let base = sanitize_file_name(client_name);
        let file = tempfile::Builder::new()
            .prefix("upload-")
            .suffix(&format!("-{}", base))
            .tempfile_in(&dir)?;
        Ok(Self {
            file,
            original_name: base,
            size: 0,
        })
    }

    fn path(&self) -> &Path {
        self.file.path()
    }

    async fn fill(mut self, field: &mut Field) -> AppResult<Self> {
        // Second handle on the open file; the guard keeps owning the path
        let mut out = tokio::fs::File::from_std(self.file.as_file().try_clone()?);
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| AppError::BadRequest(format!("Chunk error: {}", e)))?;
            out.write_all(&chunk).await?;
            self.size += chunk.len() as u64;
        }
        out.flush().await?;
        Ok(self)
    }
}

fn upload_dir() -> PathBuf {
    std::env::temp_dir().join("whisper-relay-uploads")
}

fn sanitize_file_name(client_name: &str) -> String {
    Path::new(client_name)
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.replace(['/', '\\'], "_"))
        .filter(|n| !n.is_empty() && n != "." && n != "..")
        .unwrap_or_else(|| "upload".to_string())
}

async fn read_text(field: &mut Field) -> AppResult<String> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk.map_err(|e| AppError::BadRequest(format!("Chunk error: {}", e)))?;
        bytes.extend_from_slice(&chunk);
    }
    String::from_utf8(bytes).map_err(|_| AppError::BadRequest("form field is not UTF-8".to_string()))
}

async fn drain(field: &mut Field) -> AppResult<()> {
    while let Some(chunk) = field.next().await {
        chunk.map_err(|e| AppError::BadRequest(format!("Chunk error: {}", e)))?;
    }
    Ok(())
}

fn parse_flag(value: &str) -> AppResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        other => Err(AppError::BadRequest(format!("'{}' is not a boolean", other))),
    }
}
