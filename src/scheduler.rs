//! Self-rescheduling background work.
//!
//! A [`Periodic`] task computes its next start time only after the current
//! run has finished, so a slow run delays the next one instead of
//! overlapping it. Cancelling the stop token prevents further runs but never
//! interrupts one in flight.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use log::debug;
use tokio::time::{Instant, sleep_until};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// A periodic task with an "already scheduled" guard.
#[derive(Debug)]
pub struct Periodic {
    name: &'static str,
    period: Duration,
    token: CancellationToken,
    scheduled: Arc<AtomicBool>,
}

impl Periodic {
    #[must_use]
    pub fn new(name: &'static str, period: Duration, token: CancellationToken) -> Self {
        Self {
            name,
            period,
            token,
            scheduled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start running `run` every period on `tracker`.
    ///
    /// Returns `false` without spawning when the task is already scheduled
    /// or has been stopped.
    pub fn spawn<F, Fut>(&self, tracker: &TaskTracker, mut run: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.token.is_cancelled() || self.scheduled.swap(true, Ordering::AcqRel) {
            return false;
        }
        let name = self.name;
        let period = self.period;
        let token = self.token.clone();
        let scheduled = Arc::clone(&self.scheduled);
        let mut next = Instant::now() + period;
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    () = sleep_until(next) => {}
                }
                run().await;
                next = Instant::now() + period;
            }
            scheduled.store(false, Ordering::Release);
            debug!("periodic task stopped: name={name}");
        });
        true
    }

    /// Prevent further runs.
    pub fn stop(&self) { self.token.cancel(); }

    /// Whether a loop is currently scheduled.
    #[must_use]
    pub fn is_scheduled(&self) -> bool { self.scheduled.load(Ordering::Acquire) }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use rstest::{fixture, rstest};
    use tokio::time::advance;

    use super::*;

    const PERIOD: Duration = Duration::from_millis(100);

    #[fixture]
    fn periodic() -> Periodic { Periodic::new("test", PERIOD, CancellationToken::new()) }

    fn counter(runs: &Arc<AtomicUsize>) -> impl FnMut() -> std::future::Ready<()> + Send + 'static {
        let runs = Arc::clone(runs);
        move || {
            runs.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    async fn step(by: Duration) {
        advance(by).await;
        tokio::task::yield_now().await;
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn runs_once_per_period(periodic: Periodic) {
        let tracker = TaskTracker::new();
        let runs = Arc::new(AtomicUsize::new(0));
        assert!(periodic.spawn(&tracker, counter(&runs)));

        for _ in 0..3 {
            step(PERIOD).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn second_spawn_is_refused(periodic: Periodic) {
        let tracker = TaskTracker::new();
        let runs = Arc::new(AtomicUsize::new(0));
        assert!(periodic.spawn(&tracker, counter(&runs)));
        assert!(!periodic.spawn(&tracker, counter(&runs)));
        assert!(periodic.is_scheduled());
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn stop_prevents_further_runs(periodic: Periodic) {
        let tracker = TaskTracker::new();
        let runs = Arc::new(AtomicUsize::new(0));
        periodic.spawn(&tracker, counter(&runs));
        step(PERIOD).await;

        periodic.stop();
        tracker.close();
        tracker.wait().await;
        step(PERIOD * 5).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!periodic.is_scheduled());
        assert!(!periodic.spawn(&tracker, counter(&runs)), "stopped tasks stay stopped");
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn slow_runs_never_overlap(periodic: Periodic) {
        let tracker = TaskTracker::new();
        let starts = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = Arc::clone(&starts);
        periodic.spawn(&tracker, move || {
            log.lock().expect("starts lock").push(Instant::now());
            tokio::time::sleep(PERIOD * 3)
        });

        tokio::time::sleep(PERIOD * 12).await;

        let starts = starts.lock().expect("starts lock").clone();
        assert!(starts.len() >= 2);
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= PERIOD * 4);
        }
    }
}
