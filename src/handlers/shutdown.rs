//! `POST /shutdown`: stop the service on request.

use actix_web::{web, HttpResponse};
use serde_json::json;

use crate::state::{ExitReason, ServicePhase, ServiceState};

/// Acknowledge, then hand the exit over to the supervisor.
///
/// The process terminates right after the response is flushed, even if a
/// transcription is still running. Callers that care must wait for their own
/// request to finish first.
pub async fn shutdown(state: web::Data<ServiceState>) -> HttpResponse {
    tracing::info!(in_flight = state.activity.in_flight(), "Shutdown requested");
    state.set_phase(ServicePhase::Terminating);
    state.exit.request(ExitReason::ShutdownRequested);

    HttpResponse::Ok().json(json!({
        "status": "shutting_down",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}
