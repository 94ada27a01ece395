//! # Background Transcription Service
//!
//! Runs the long-lived HTTP service the client talks to. One process holds one
//! loaded model and serves requests one inference at a time until it is told
//! to stop or goes idle.
//!
//! ## Startup sequence:
//! 1. Bind the listener (so a second copy started concurrently fails fast on the port)
//! 2. Load the model on the blocking pool; `/health` and `/transcribe` answer 503 meanwhile
//! 3. Mark the service ready and start the inactivity watchdog
//!
//! ## Termination:
//! The watchdog and the `/shutdown` handler both send an [`ExitReason`]. The
//! supervisor loop below is the only place that ends the process: it gives the
//! shutdown acknowledgement a moment to flush, then exits without waiting for
//! in-flight work.
//!
//! ## Rust Concepts Used:
//! - **Generic closures**: the model loader is any `FnOnce` returning an engine,
//!   so the Whisper download stays out of the startup logic
//! - **tokio::select!**: races model loading / the HTTP server against exit requests

use std::net::SocketAddr;
use std::time::Duration;

use actix_web::dev::ServerHandle;
use actix_web::{web, App, HttpServer};
use anyhow::{anyhow, Context, Result};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;

use crate::config::AppConfig;
use crate::device;
use crate::error::AppResult;
use crate::handlers;
use crate::state::{ExitReason, ServicePhase, ServiceState};
use crate::transcription::{ModelSize, TranscriptionEngine};
use crate::watchdog::Watchdog;

/// Time given to the last response to leave the socket before the process exits.
const EXIT_FLUSH_DELAY: Duration = Duration::from_millis(200);

/// Run the service with the configured Whisper model until it exits.
///
/// Returns `Ok` only when the HTTP server stops cleanly by itself (e.g. Ctrl+C).
/// Startup and server failures are errors. Idle and requested shutdowns end the
/// process directly with status 0.
pub async fn run(config: AppConfig) -> Result<()> {
    let size: ModelSize = config.model.parse()?;

    if config.unverified_ssl_context {
        warn!("unverified_ssl_context is set; certificate checks stay enabled for model downloads");
    }

    let device_preference = config.device.clone();
    let loader = move || {
        let device = device::select_device(&device_preference);
        TranscriptionEngine::load(size, device)
    };

    let mut service = Service::bind(config)?;
    if let Some(reason) = service.load(loader).await? {
        terminate(service.state(), reason).await;
    }
    service.start_watchdog();

    match service.supervise().await? {
        Some(reason) => terminate(service.state(), reason).await,
        None => Ok(()),
    }
}

/// A bound HTTP service and the channel its exit requests arrive on.
pub struct Service {
    state: web::Data<ServiceState>,
    exit_rx: UnboundedReceiver<ExitReason>,
    server_handle: ServerHandle,
    server_task: JoinHandle<std::io::Result<()>>,
    addr: SocketAddr,
}

impl Service {
    /// Bind the listener and start answering requests. The model is not loaded
    /// yet, so the phase is `Starting` and readiness is refused.
    pub fn bind(config: AppConfig) -> Result<Self> {
        let (exit, exit_rx) = crate::state::ExitHandle::channel();
        let state = web::Data::new(ServiceState::new(config.clone(), exit));
        let bind_addr = config.server.bind_addr();

        let app_state = state.clone();
        let server = HttpServer::new(move || {
            App::new()
                .app_data(app_state.clone())
                .wrap(TracingLogger::default())
                .configure(handlers::routes)
        })
        .bind(&bind_addr)
        .with_context(|| format!("binding {}", bind_addr))?;

        // The real address, which differs from the configured one for port 0
        let addr = server
            .addrs()
            .first()
            .copied()
            .ok_or_else(|| anyhow!("no listener bound on {}", bind_addr))?;
        let server = server.run();

        info!(
            version = env!("CARGO_PKG_VERSION"),
            addr = %addr,
            pid = std::process::id(),
            "Service listening, loading model"
        );

        Ok(Self {
            state,
            exit_rx,
            server_handle: server.handle(),
            server_task: tokio::spawn(server),
            addr,
        })
    }

    pub fn state(&self) -> &ServiceState {
        &self.state
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Load the engine on the blocking pool while the listener keeps answering 503.
    ///
    /// ## Returns:
    /// - `Ok(None)`: the engine is installed and the phase is `Ready`
    /// - `Ok(Some(reason))`: an exit was requested before loading finished
    /// - `Err(..)`: loading failed; the phase is `Terminating` and the listener is stopped
    pub async fn load<F>(&mut self, loader: F) -> Result<Option<ExitReason>>
    where
        F: FnOnce() -> AppResult<TranscriptionEngine> + Send + 'static,
    {
        let load_task = tokio::task::spawn_blocking(loader);

        let loaded = tokio::select! {
            loaded = load_task => loaded,
            Some(reason) = self.exit_rx.recv() => return Ok(Some(reason)),
        };

        let failure = match loaded {
            Ok(Ok(engine)) => {
                info!(model = engine.model_name(), "Service ready");
                self.state.mark_ready(engine);
                return Ok(None);
            }
            Ok(Err(e)) => anyhow::Error::new(e).context("loading model"),
            Err(join_error) => anyhow!("model loader panicked: {}", join_error),
        };

        self.state.set_phase(ServicePhase::Terminating);
        error!(error = %failure, "Model failed to load");
        self.stop_server().await;
        Err(failure)
    }

    /// Start the inactivity watchdog. Called once the model is loaded, so load
    /// time never counts as idle time.
    pub fn start_watchdog(&self) -> JoinHandle<()> {
        let config = &self.state.config;
        Watchdog {
            activity: self.state.activity.clone(),
            idle_timeout: config.server.idle_timeout(),
            interval: config.server.watchdog_interval(),
            exit: self.state.exit.clone(),
        }
        .spawn()
    }

    /// Wait for an exit request or for the HTTP server to stop.
    ///
    /// `Ok(Some(reason))` asks the caller to terminate; `Ok(None)` is a clean
    /// server stop; a crashed server is an error.
    pub async fn supervise(&mut self) -> Result<Option<ExitReason>> {
        let stopped = tokio::select! {
            stopped = &mut self.server_task => stopped,
            Some(reason) = self.exit_rx.recv() => return Ok(Some(reason)),
        };

        self.state.set_phase(ServicePhase::Terminating);
        match stopped {
            Ok(Ok(())) => {
                info!("Server stopped");
                Ok(None)
            }
            Ok(Err(e)) => Err(anyhow::Error::new(e).context("HTTP server failed")),
            Err(e) => Err(anyhow!("HTTP server task failed: {}", e)),
        }
    }

    /// Stop accepting connections without waiting for in-flight requests.
    pub async fn stop_server(&self) {
        self.server_handle.stop(false).await;
    }
}

async fn terminate(state: &ServiceState, reason: ExitReason) -> ! {
    state.set_phase(ServicePhase::Terminating);
    match reason {
        ExitReason::IdleTimeout { idle } => {
            info!(idle_secs = idle.as_secs(), "Exiting after inactivity")
        }
        ExitReason::ShutdownRequested => info!("Exiting on request"),
    }
    tokio::time::sleep(EXIT_FLUSH_DELAY).await;
    std::process::exit(0)
}
