//! # Client Orchestrator
//!
//! Gets a transcript from the background service without the caller having to
//! know whether one is running.
//!
//! ## Auto-start protocol:
//! 1. Check the service's health; if it answers, use it
//! 2. Otherwise take the spawn lock and launch a detached service
//!    (or, when another invocation holds the lock, just wait for theirs)
//! 3. Poll the health check at a fixed interval for a bounded number of attempts
//! 4. Give up with `ServiceStartTimeout`; there is no in-process fallback
//!
//! The file is sent once. A failure after dispatch is reported, never retried,
//! because a half-finished inference may still be running on the service.
//!
//! ## Rust Concepts:
//! - **Generic over traits**: `Orchestrator<E, L>` takes any [`ServiceEndpoint`]
//!   and [`ServiceLauncher`], so the tests drive it with in-memory fakes
//! - **Guard closures**: the caller's progress indicator is a value created by a
//!   closure and dropped when the request ends

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::launcher::{ServiceLauncher, SpawnLock};
use crate::client::service_client::ServiceEndpoint;
use crate::config::ClientConfig;
use crate::error::{AppError, AppResult};
use crate::transcription::TranscriptionResult;

pub struct Orchestrator<E, L> {
    endpoint: E,
    launcher: L,
    poll_interval: Duration,
    poll_attempts: u32,
    startup_window: Duration,
    lock_path: PathBuf,
}

impl<E: ServiceEndpoint, L: ServiceLauncher> Orchestrator<E, L> {
    pub fn new(endpoint: E, launcher: L, client: &ClientConfig, lock_path: PathBuf) -> Self {
        Self {
            endpoint,
            launcher,
            poll_interval: client.poll_interval(),
            poll_attempts: client.poll_attempts,
            startup_window: client.startup_window(),
            lock_path,
        }
    }

    /// Make sure a ready service is reachable, starting one if needed.
    pub async fn ensure_service(&self) -> AppResult<()> {
        if self.endpoint.is_ready().await {
            tracing::debug!("Service already running");
            return Ok(());
        }

        // Held until polling ends, so latecomers wait instead of spawning
        let _lock = match SpawnLock::acquire(&self.lock_path, self.startup_window) {
            Ok(Some(lock)) => {
                self.launcher.launch()?;
                Some(lock)
            }
            Ok(None) => {
                tracing::info!("Another invocation is starting the server, waiting for it");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Spawn lock unavailable, starting server without it");
                self.launcher.launch()?;
                None
            }
        };

        for attempt in 1..=self.poll_attempts {
            tokio::time::sleep(self.poll_interval).await;
            if self.endpoint.is_ready().await {
                tracing::info!(attempt, "Server is running.");
                return Ok(());
            }
            tracing::debug!(attempt, "Server not ready yet");
        }

        Err(AppError::ServiceStartTimeout {
            attempts: self.poll_attempts,
        })
    }

    /// Transcribe `input` through the service, always asking for timed segments.
    ///
    /// The guard returned by `progress` is held while the upload and inference
    /// run. It is only created once the service answers, so startup log lines
    /// never fight with a spinner for the terminal line.
    pub async fn transcribe<G>(
        &self,
        input: &Path,
        language: &str,
        progress: impl FnOnce() -> G,
    ) -> AppResult<TranscriptionResult> {
        if !input.is_file() {
            return Err(AppError::InputNotFound(input.display().to_string()));
        }
        self.ensure_service().await?;

        tracing::info!(input = %input.display(), language, "Sending file to server");
        let _progress = progress();
        self.endpoint.transcribe(input, language).await
    }

    /// Ask a running service to exit. Never spawns one.
    pub async fn stop(&self) -> AppResult<()> {
        self.endpoint.shutdown().await?;
        tracing::info!("Server shutdown requested.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::engine::fakes::{hello_world, scratch_media};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Becomes ready after `polls_needed` health checks following a launch.
    #[derive(Clone, Default)]
    struct FakeService {
        launched: Arc<AtomicBool>,
        launches: Arc<AtomicUsize>,
        checks_since_launch: Arc<AtomicUsize>,
        transcribe_calls: Arc<AtomicUsize>,
        polls_needed: usize,
    }

    #[async_trait]
    impl ServiceEndpoint for FakeService {
        async fn is_ready(&self) -> bool {
            if !self.launched.load(Ordering::SeqCst) {
                return false;
            }
            let checks = self.checks_since_launch.fetch_add(1, Ordering::SeqCst) + 1;
            checks >= self.polls_needed
        }

        async fn transcribe(&self, _path: &Path, _language: &str) -> AppResult<TranscriptionResult> {
            self.transcribe_calls.fetch_add(1, Ordering::SeqCst);
            Ok(hello_world())
        }

        async fn shutdown(&self) -> AppResult<()> {
            Err(AppError::ServiceUnreachable("connection refused".to_string()))
        }
    }

    impl ServiceLauncher for FakeService {
        fn launch(&self) -> AppResult<()> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            self.launched.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn client_config(poll_attempts: u32) -> ClientConfig {
        ClientConfig {
            health_timeout_ms: 1000,
            poll_interval_ms: 1000,
            poll_attempts,
        }
    }

    /// Lock path inside a directory that is removed when the guard drops.
    fn scratch_lock() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spawn.lock");
        (dir, path)
    }

    fn orchestrator(service: &FakeService, poll_attempts: u32, lock: PathBuf) -> Orchestrator<FakeService, FakeService> {
        Orchestrator::new(service.clone(), service.clone(), &client_config(poll_attempts), lock)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_third_poll_dispatches_once() {
        let service = FakeService {
            polls_needed: 3,
            ..Default::default()
        };
        let (_dir, lock) = scratch_lock();
        let orchestrator = orchestrator(&service, 10, lock);

        let result = orchestrator.transcribe(scratch_media().path(), "uk", || ()).await.unwrap();

        assert_eq!(result, hello_world());
        assert_eq!(service.launches.load(Ordering::SeqCst), 1);
        assert_eq!(service.checks_since_launch.load(Ordering::SeqCst), 3);
        assert_eq!(service.transcribe_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_service_is_not_spawned_again() {
        let service = FakeService {
            polls_needed: 1,
            ..Default::default()
        };
        service.launched.store(true, Ordering::SeqCst);
        let (_dir, lock) = scratch_lock();
        let orchestrator = orchestrator(&service, 10, lock);

        orchestrator.transcribe(scratch_media().path(), "en", || ()).await.unwrap();
        assert_eq!(service.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_timeout_is_fatal() {
        let service = FakeService {
            polls_needed: usize::MAX,
            ..Default::default()
        };
        let (_dir, lock) = scratch_lock();
        let orchestrator = orchestrator(&service, 4, lock.clone());

        let err = orchestrator.transcribe(scratch_media().path(), "uk", || ()).await.unwrap_err();
        assert!(matches!(err, AppError::ServiceStartTimeout { attempts: 4 }));
        assert_eq!(service.transcribe_calls.load(Ordering::SeqCst), 0);
        // The spawner releases the lock once it stops polling
        assert!(!lock.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_invocations_spawn_once() {
        let service = FakeService {
            polls_needed: 4,
            ..Default::default()
        };
        let (_dir, lock) = scratch_lock();
        let first = orchestrator(&service, 10, lock.clone());
        let second = orchestrator(&service, 10, lock);
        let media = scratch_media();

        let (a, b) = tokio::join!(
            first.transcribe(media.path(), "uk", || ()),
            second.transcribe(media.path(), "uk", || ())
        );

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(service.launches.load(Ordering::SeqCst), 1);
        assert_eq!(service.transcribe_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_starts_after_service_is_ready() {
        let service = FakeService {
            polls_needed: 3,
            ..Default::default()
        };
        let (_dir, lock) = scratch_lock();
        let orchestrator = orchestrator(&service, 10, lock);

        let seen = std::sync::Mutex::new(None);
        orchestrator
            .transcribe(scratch_media().path(), "uk", || {
                *seen.lock().unwrap() = Some((
                    service.launches.load(Ordering::SeqCst),
                    service.checks_since_launch.load(Ordering::SeqCst),
                    service.transcribe_calls.load(Ordering::SeqCst),
                ));
            })
            .await
            .unwrap();

        // Launched and ready, nothing dispatched yet
        assert_eq!(*seen.lock().unwrap(), Some((1, 3, 0)));
        assert_eq!(service.transcribe_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_input_never_spawns() {
        let service = FakeService::default();
        let (_dir, lock) = scratch_lock();
        let orchestrator = orchestrator(&service, 10, lock);

        let err = orchestrator
            .transcribe(Path::new("/definitely/not/here.mp3"), "uk", || ())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "input_not_found");
        assert_eq!(service.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_reports_unreachable_without_spawning() {
        let service = FakeService::default();
        let (_dir, lock) = scratch_lock();
        let orchestrator = orchestrator(&service, 10, lock);

        let err = orchestrator.stop().await.unwrap_err();
        assert_eq!(err.kind(), "service_unreachable");
        assert_eq!(service.launches.load(Ordering::SeqCst), 0);
    }
}
