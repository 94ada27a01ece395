//! # Inactivity Watchdog
//!
//! Background task that terminates the service after a period without requests,
//! so a model holding gigabytes of (GPU) memory does not linger forever.
//!
//! ## Behavior:
//! - Wakes every `interval` (30 s by default)
//! - Fires when the service has been idle for strictly longer than `idle_timeout`
//! - Never fires while a request is in flight, however long the inference takes
//! - Fires at most once, then exits
//!
//! The process can therefore live up to `idle_timeout + interval` after its last request.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::state::{ActivityClock, ExitHandle, ExitReason};

pub struct Watchdog {
    pub activity: Arc<ActivityClock>,
    pub idle_timeout: Duration,
    pub interval: Duration,
    pub exit: ExitHandle,
}

impl Watchdog {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        tracing::info!(
            idle_timeout_secs = self.idle_timeout.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Inactivity watchdog started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let in_flight = self.activity.in_flight();
            if in_flight > 0 {
                tracing::debug!(in_flight, "Requests in flight, not idle");
                continue;
            }

            let idle = self.activity.idle_for();
            if idle > self.idle_timeout {
                tracing::info!(idle_secs = idle.as_secs(), "Inactivity timeout reached, shutting down");
                self.exit.request(ExitReason::IdleTimeout { idle });
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn watchdog(activity: Arc<ActivityClock>, exit: ExitHandle) -> Watchdog {
        Watchdog {
            activity,
            idle_timeout: Duration::from_secs(600),
            interval: Duration::from_secs(30),
            exit,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_idle_timeout() {
        let activity = Arc::new(ActivityClock::new());
        let (exit, mut rx) = ExitHandle::channel();
        let start = Instant::now();
        watchdog(activity, exit).spawn();

        let reason = rx.recv().await.unwrap();
        let elapsed = start.elapsed();

        assert!(matches!(reason, ExitReason::IdleTimeout { .. }));
        assert!(elapsed > Duration::from_secs(600));
        assert!(elapsed <= Duration::from_secs(630));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_before_timeout() {
        let activity = Arc::new(ActivityClock::new());
        let (exit, mut rx) = ExitHandle::channel();
        watchdog(activity, exit).spawn();

        tokio::time::sleep(Duration::from_secs(595)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_postpones_exit() {
        let activity = Arc::new(ActivityClock::new());
        let (exit, mut rx) = ExitHandle::channel();
        let start = Instant::now();
        watchdog(activity.clone(), exit).spawn();

        tokio::time::sleep(Duration::from_secs(500)).await;
        activity.touch();

        rx.recv().await.unwrap();
        assert!(start.elapsed() > Duration::from_secs(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_request_is_never_idle() {
        let activity = Arc::new(ActivityClock::new());
        let (exit, mut rx) = ExitHandle::channel();
        watchdog(activity.clone(), exit).spawn();

        let guard = activity.begin_request();
        let waited = tokio::time::timeout(Duration::from_secs(3600), rx.recv()).await;
        assert!(waited.is_err());

        // Finishing the request restarts the idle countdown from now
        drop(guard);
        let finished = Instant::now();
        rx.recv().await.unwrap();
        assert!(finished.elapsed() > Duration::from_secs(600));
    }
}
