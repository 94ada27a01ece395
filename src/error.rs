//! # Error Handling
//!
//! One error type for the whole binary. The same enum is used by the server
//! (where it becomes an HTTP response) and by the client (where `main` prints it
//! and exits with a failure status).
//!
//! ## Error Categories:
//! - **InputNotFound**: the media file does not exist, request aborted
//! - **ServiceUnreachable**: the background service could not be contacted
//! - **ServiceStartTimeout**: a freshly spawned service never became ready
//! - **EngineFailure**: opaque failure from the speech engine, reported as-is
//! - **OutputWriteFailure**: the transcript could not be written to disk
//! - **BadRequest / NotReady / ConfigError / Internal**: plumbing failures

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the application.
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::InputNotFound(path.display().to_string()));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// The media file passed by the user does not exist or is not a file
    InputNotFound(String),

    /// Network or connection failure while talking to the service
    ServiceUnreachable(String),

    /// The service was spawned but never answered the readiness check
    ServiceStartTimeout { attempts: u32 },

    /// Anything that went wrong inside the speech engine
    EngineFailure(String),

    /// The formatted transcript could not be written to its destination
    OutputWriteFailure(String),

    /// Client sent invalid or incomplete data
    BadRequest(String),

    /// The service is still loading its model or is shutting down
    NotReady(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// Everything else
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::InputNotFound(path) => write!(f, "Media file not found: {}", path),
            AppError::ServiceUnreachable(msg) => write!(f, "Could not connect to server: {}", msg),
            AppError::ServiceStartTimeout { attempts } => write!(
                f,
                "Failed to start server: not ready after {} readiness checks",
                attempts
            ),
            AppError::EngineFailure(msg) => write!(f, "Transcription failed: {}", msg),
            AppError::OutputWriteFailure(msg) => write!(f, "Failed to save file: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotReady(msg) => write!(f, "Service not ready: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// Machine-readable error type used in JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::InputNotFound(_) => "input_not_found",
            AppError::ServiceUnreachable(_) => "service_unreachable",
            AppError::ServiceStartTimeout { .. } => "service_start_timeout",
            AppError::EngineFailure(_) => "engine_failure",
            AppError::OutputWriteFailure(_) => "output_write_failure",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotReady(_) => "not_ready",
            AppError::ConfigError(_) => "config_error",
            AppError::Internal(_) => "internal_error",
        }
    }
}

/// Converts errors into HTTP responses for the service endpoints.
///
/// ## HTTP Status Code Mapping:
/// - BadRequest/InputNotFound → 400
/// - NotReady → 503
/// - everything else → 500
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "engine_failure",
///     "message": "Transcription failed: unsupported codec",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            AppError::BadRequest(_) | AppError::InputNotFound(_) => StatusCode::BAD_REQUEST,
            AppError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Automatic conversion from anyhow::Error to AppError.
///
/// The alternate formatter keeps the whole context chain in the message.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(format!("I/O error: {}", err))
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::NotReady("loading".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::EngineFailure("boom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_messages_are_human_readable() {
        let err = AppError::ServiceStartTimeout { attempts: 10 };
        assert_eq!(
            err.to_string(),
            "Failed to start server: not ready after 10 readiness checks"
        );
        let err = AppError::InputNotFound("/tmp/missing.mp3".into());
        assert!(err.to_string().contains("/tmp/missing.mp3"));
    }

    #[test]
    fn test_anyhow_conversion_keeps_context() {
        let err = anyhow::anyhow!("disk full").context("writing upload");
        let app: AppError = err.into();
        assert_eq!(app.kind(), "internal_error");
        assert!(app.to_string().contains("writing upload: disk full"));
    }
}
