//! HTTP client for the background service.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::transcription::TranscriptionResult;

/// What the orchestrator needs from a running service.
#[async_trait]
pub trait ServiceEndpoint: Send + Sync {
    /// True when a service instance answers its readiness check.
    async fn is_ready(&self) -> bool;

    /// Upload `path` and return the richest result the service can produce.
    async fn transcribe(&self, path: &Path, language: &str) -> AppResult<TranscriptionResult>;

    /// Ask the service to exit. Success means the request was delivered.
    async fn shutdown(&self) -> AppResult<()>;
}

pub struct HttpServiceClient {
    base_url: String,
    http: reqwest::Client,
    health_timeout: Duration,
}

impl HttpServiceClient {
    pub fn new(base_url: impl Into<String>, health_timeout: Duration) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| AppError::Internal(format!("HTTP client init failed: {}", e)))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            health_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Error body produced by the service's `ResponseError` impl.
#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

/// Rebuild the service-side error so the caller sees the same category.
///
/// The service message already starts with the category's display prefix,
/// which is dropped so it is not printed twice.
fn error_from_response(status: reqwest::StatusCode, body: &str) -> AppError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(ErrorEnvelope { error }) => {
            let detail = error
                .message
                .split_once(": ")
                .map(|(_, rest)| rest.to_string())
                .unwrap_or_else(|| error.message.clone());
            match error.kind.as_str() {
                "engine_failure" => AppError::EngineFailure(detail),
                "input_not_found" => AppError::InputNotFound(detail),
                "bad_request" => AppError::BadRequest(detail),
                "not_ready" => AppError::NotReady(detail),
                _ => AppError::Internal(format!("service returned {}: {}", status, error.message)),
            }
        }
        Err(_) => AppError::Internal(format!("service returned {}: {}", status, body.trim())),
    }
}

fn unreachable(e: reqwest::Error) -> AppError {
    AppError::ServiceUnreachable(e.to_string())
}

#[async_trait]
impl ServiceEndpoint for HttpServiceClient {
    async fn is_ready(&self) -> bool {
        match self
            .http
            .get(self.url("/health"))
            .timeout(self.health_timeout)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, "Readiness check failed");
                false
            }
        }
    }

    async fn transcribe(&self, path: &Path, language: &str) -> AppResult<TranscriptionResult> {
        let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => AppError::InputNotFound(path.display().to_string()),
            _ => AppError::Internal(format!("reading {}: {}", path.display(), e)),
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());

        let file_part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("application/octet-stream")
            .map_err(|e| AppError::Internal(e.to_string()))?;
        let form = Form::new()
            .part("file", file_part)
            .text("language", language.to_string())
            .text("timestamps", "true");

        // No timeout: inference time grows with the media duration
        let response = self
            .http
            .post(self.url("/transcribe"))
            .multipart(form)
            .send()
            .await
            .map_err(unreachable)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_from_response(status, &body));
        }

        response
            .json::<TranscriptionResult>()
            .await
            .map_err(|e| AppError::Internal(format!("invalid transcription response: {}", e)))
    }

    async fn shutdown(&self) -> AppResult<()> {
        let response = self
            .http
            .post(self.url("/shutdown"))
            .timeout(self.health_timeout)
            .send()
            .await
            .map_err(unreachable)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(error_from_response(status, &body));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A local port with nothing listening on it.
    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn client_for(port: u16) -> HttpServiceClient {
        HttpServiceClient::new(format!("http://127.0.0.1:{}", port), Duration::from_millis(500)).unwrap()
    }

    #[tokio::test]
    async fn test_stop_without_service_is_unreachable() {
        let client = client_for(closed_port());
        let err = client.shutdown().await.unwrap_err();
        assert_eq!(err.kind(), "service_unreachable");
    }

    #[tokio::test]
    async fn test_health_check_without_service_is_not_ready() {
        assert!(!client_for(closed_port()).is_ready().await);
    }

    #[tokio::test]
    async fn test_missing_input_is_reported_before_network() {
        let client = client_for(closed_port());
        let err = client
            .transcribe(Path::new("/definitely/not/here.mp3"), "uk")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "input_not_found");
    }

    #[test]
    fn test_error_body_maps_back_to_category() {
        let body = r#"{"error": {"type": "engine_failure", "message": "Transcription failed: bad codec", "timestamp": "x"}}"#;
        let err = error_from_response(reqwest::StatusCode::INTERNAL_SERVER_ERROR, body);
        assert_eq!(err.kind(), "engine_failure");
        assert_eq!(err.to_string(), "Transcription failed: bad codec");

        let err = error_from_response(reqwest::StatusCode::BAD_GATEWAY, "<html>proxy</html>");
        assert_eq!(err.kind(), "internal_error");
    }
}
