//! # Client Side
//!
//! Everything a short-lived invocation needs to use the background service:
//! - `service_client`: HTTP calls to a running service
//! - `launcher`: starting a detached service and the spawn lock
//! - `orchestrator`: health check, spawn, poll, dispatch
//! - `progress`: terminal spinner shown while waiting

pub mod launcher;
pub mod orchestrator;
pub mod progress;
pub mod service_client;

pub use launcher::{ProcessLauncher, ServiceLauncher, SpawnLock};
pub use orchestrator::Orchestrator;
pub use progress::Spinner;
pub use service_client::{HttpServiceClient, ServiceEndpoint};

use std::path::{Path, PathBuf};

use crate::config::AppConfig;
use crate::error::AppResult;
use crate::transcription::TranscriptionResult;

fn orchestrator(
    config: &AppConfig,
    config_path: Option<&Path>,
) -> AppResult<Orchestrator<HttpServiceClient, ProcessLauncher>> {
    let endpoint = HttpServiceClient::new(config.server.base_url(), config.client.health_timeout())?;
    let launcher = ProcessLauncher {
        config_path: config_path.map(Path::to_path_buf),
        expandable_segments: config.expandable_segments,
        port: config.server.port,
    };
    let lock_path: PathBuf = SpawnLock::default_path(config.server.port);
    Ok(Orchestrator::new(endpoint, launcher, &config.client, lock_path))
}

/// Transcribe `input` through the background service, starting it if needed.
pub async fn transcribe(
    config: &AppConfig,
    config_path: Option<&Path>,
    input: &Path,
    language: &str,
    show_progress: bool,
) -> AppResult<TranscriptionResult> {
    orchestrator(config, config_path)?
        .transcribe(input, language, || Spinner::start("Transcribing...", show_progress))
        .await
}

/// Ask the background service to exit.
pub async fn stop(config: &AppConfig) -> AppResult<()> {
    orchestrator(config, None)?.stop().await
}
