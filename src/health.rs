//! Readiness endpoint of the background service.
//!
//! The client calls `GET /health` to decide whether a service is already
//! running. Only a service that has finished loading its model answers 200;
//! while starting or terminating it answers 503 so callers keep waiting or
//! spawn a fresh one.

use actix_web::{web, HttpResponse};
use serde_json::json;

use crate::state::{ServicePhase, ServiceState};

pub async fn health_check(state: web::Data<ServiceState>) -> HttpResponse {
    let phase = state.phase();
    let engine = state.engine();

    let body = json!({
        "status": phase.as_str(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "pid": std::process::id()
        },
        "activity": {
            "idle_seconds": state.activity.idle_for().as_secs(),
            "in_flight": state.activity.in_flight(),
            "idle_timeout_seconds": state.config.server.idle_timeout_secs
        },
        "model": engine.as_ref().map(|engine| {
            let stats = engine.stats();
            json!({
                "name": engine.model_name(),
                "total_requests": stats.total_requests,
                "failed_requests": stats.failed_requests,
                "average_processing_ms": stats.average_processing_ms()
            })
        })
    });

    match phase {
        ServicePhase::Ready => HttpResponse::Ok().json(body),
        _ => HttpResponse::ServiceUnavailable().json(body),
    }
}
