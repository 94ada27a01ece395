//! HTTP handlers of the background service.

pub mod shutdown;
pub mod transcribe;

use actix_web::web;

pub use shutdown::shutdown;
pub use transcribe::transcribe;

/// Route table, shared by the server and handler tests.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(crate::health::health_check))
        .route("/transcribe", web::post().to(transcribe))
        .route("/transcribe/", web::post().to(transcribe))
        .route("/shutdown", web::post().to(shutdown));
}
