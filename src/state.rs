//! # Service State
//!
//! Shared state for the background transcription service. Every HTTP handler,
//! the inactivity watchdog and the supervisor loop hold a reference to the same
//! [`ServiceState`].
//!
//! ## Key pieces:
//! - **Phase**: `Starting` until the model is loaded, `Ready` while serving, `Terminating` on the way out
//! - **Activity clock**: when the service was last used and how many requests are in flight
//! - **Exit handle**: the only way anything asks the process to stop
//!
//! ## Rust Concepts:
//! - **Atomics instead of locks**: the activity timestamp is a single `AtomicU64`
//!   store, so the watchdog never reads a half-written value and never blocks a handler
//! - **OnceLock**: the engine is set exactly once after loading and read lock-free afterwards
//! - **RAII guards**: [`InFlightGuard`] decrements the in-flight count even when a handler errors out

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::AppConfig;
use crate::transcription::TranscriptionEngine;

/// Lifecycle of the service process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServicePhase {
    Starting = 0,
    Ready = 1,
    Terminating = 2,
}

impl ServicePhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ServicePhase::Ready,
            2 => ServicePhase::Terminating,
            _ => ServicePhase::Starting,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServicePhase::Starting => "starting",
            ServicePhase::Ready => "ready",
            ServicePhase::Terminating => "terminating",
        }
    }
}

/// Why the process is going away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// No request for longer than the idle timeout
    IdleTimeout { idle: Duration },
    /// A client called the shutdown endpoint
    ShutdownRequested,
}

/// Sending side of the exit channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ExitHandle {
    tx: mpsc::UnboundedSender<ExitReason>,
}

impl ExitHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ExitReason>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Ask the supervisor to terminate the process.
    pub fn request(&self, reason: ExitReason) {
        if self.tx.send(reason).is_err() {
            tracing::warn!(?reason, "Exit requested but the supervisor is gone");
        }
    }
}

/// Tracks the last time the service did useful work.
///
/// Time is kept as milliseconds since `origin` so that it fits in one atomic.
/// Uses tokio's clock, which tests can pause and advance.
#[derive(Debug)]
pub struct ActivityClock {
    origin: Instant,
    last_used_ms: AtomicU64,
    in_flight: AtomicUsize,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_used_ms: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Mark the service as used right now.
    pub fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_used_ms.fetch_max(now, Ordering::SeqCst);
    }

    pub fn idle_for(&self) -> Duration {
        let now = self.origin.elapsed().as_millis() as u64;
        let last = self.last_used_ms.load(Ordering::SeqCst);
        Duration::from_millis(now.saturating_sub(last))
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Count a request as in flight until the guard is dropped.
    ///
    /// Touches the clock on both ends, so a long inference never looks idle
    /// the moment it finishes.
    pub fn begin_request(self: &Arc<Self>) -> InFlightGuard {
        self.touch();
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard { clock: self.clone() }
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InFlightGuard {
    clock: Arc<ActivityClock>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.clock.touch();
        self.clock.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The state shared by all handlers of the service.
pub struct ServiceState {
    pub config: AppConfig,
    pub activity: Arc<ActivityClock>,
    pub exit: ExitHandle,
    engine: OnceLock<Arc<TranscriptionEngine>>,
    phase: AtomicU8,
    start_time: std::time::Instant,
}

impl ServiceState {
    pub fn new(config: AppConfig, exit: ExitHandle) -> Self {
        Self {
            config,
            activity: Arc::new(ActivityClock::new()),
            exit,
            engine: OnceLock::new(),
            phase: AtomicU8::new(ServicePhase::Starting as u8),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn phase(&self) -> ServicePhase {
        ServicePhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Move to `phase`. `Terminating` is absorbing: once set, later calls are ignored.
    pub fn set_phase(&self, phase: ServicePhase) {
        let terminating = ServicePhase::Terminating as u8;
        let changed = self
            .phase
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != terminating).then_some(phase as u8)
            })
            .is_ok();
        if changed {
            tracing::debug!(phase = phase.as_str(), "Service phase changed");
        }
    }

    /// Install the loaded engine and start serving.
    ///
    /// The idle clock starts from here; model loading never counts as idle time.
    pub fn mark_ready(&self, engine: TranscriptionEngine) {
        if self.engine.set(Arc::new(engine)).is_err() {
            tracing::warn!("Engine was already installed, keeping the first one");
        }
        self.activity.touch();
        self.set_phase(ServicePhase::Ready);
    }

    /// The engine, once the service is ready.
    pub fn engine(&self) -> Option<Arc<TranscriptionEngine>> {
        match self.phase() {
            ServicePhase::Ready => self.engine.get().cloned(),
            _ => None,
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::engine::fakes::{hello_world, ScriptedRecognizer};

    #[tokio::test(start_paused = true)]
    async fn test_idle_time_follows_touches() {
        let clock = Arc::new(ActivityClock::new());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(clock.idle_for(), Duration::from_secs(5));

        clock.touch();
        assert_eq!(clock.idle_for(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_guard_touches_on_both_ends() {
        let clock = Arc::new(ActivityClock::new());
        tokio::time::advance(Duration::from_secs(10)).await;

        let guard = clock.begin_request();
        assert_eq!(clock.in_flight(), 1);
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(clock.idle_for(), Duration::from_secs(20));

        drop(guard);
        assert_eq!(clock.in_flight(), 0);
        assert_eq!(clock.idle_for(), Duration::ZERO);
    }

    #[test]
    fn test_engine_hidden_until_ready() {
        let (exit, _rx) = ExitHandle::channel();
        let state = ServiceState::new(AppConfig::default(), exit);
        assert_eq!(state.phase(), ServicePhase::Starting);
        assert!(state.engine().is_none());

        state.mark_ready(TranscriptionEngine::new(Box::new(ScriptedRecognizer::returning(
            hello_world(),
        ))));
        assert_eq!(state.phase(), ServicePhase::Ready);
        assert!(state.engine().is_some());

        state.set_phase(ServicePhase::Terminating);
        assert!(state.engine().is_none());

        state.set_phase(ServicePhase::Ready);
        assert_eq!(state.phase(), ServicePhase::Terminating);
    }

    #[test]
    fn test_exit_handle_delivers_reason() {
        let (exit, mut rx) = ExitHandle::channel();
        exit.clone().request(ExitReason::ShutdownRequested);
        assert_eq!(rx.try_recv().unwrap(), ExitReason::ShutdownRequested);
    }
}
