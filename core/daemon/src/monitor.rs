//! The once-per-interval monitor loop.
//!
//! Ticks never overlap: the next one starts only after the previous tick
//! finished and the interval elapsed. A failed tick is logged and the loop
//! keeps going; only cancellation stops it.

use chrono::{DateTime, SubsecRound, Utc};
use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::reconcile::Reconciler;
use crate::sampler::ProcessSampler;
use crate::shutdown::CancellationToken;

/// Wall clock truncated to the store's millisecond precision.
pub fn clock_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

pub fn run<S: ProcessSampler>(
    reconciler: &mut Reconciler<S>,
    token: &CancellationToken,
    interval: Duration,
    clock: impl Fn() -> DateTime<Utc>,
) {
    info!(interval_ms = interval.as_millis() as u64, "Monitor loop started");

    while !token.is_cancelled() {
        match reconciler.tick(clock()) {
            Ok(report) => {
                if report.opened > 0 || report.closed > 0 || report.dropped > 0 {
                    debug!(
                        sampled = report.sampled,
                        relevant = report.relevant,
                        opened = report.opened,
                        closed = report.closed,
                        dropped = report.dropped,
                        failed = report.failed,
                        "Tick applied changes"
                    );
                }
                reconciler.state().record_tick(report);
            }
            Err(err) => {
                warn!(kind = err.kind(), error = %err, "Monitor tick failed");
            }
        }

        if token.wait_timeout(interval) {
            break;
        }
    }

    info!(
        open_sessions = reconciler.state().open_session_count(),
        "Monitor loop stopped"
    );
}

pub fn spawn_monitor<S>(
    mut reconciler: Reconciler<S>,
    token: CancellationToken,
    interval: Duration,
) -> io::Result<JoinHandle<()>>
where
    S: ProcessSampler + Send + 'static,
{
    thread::Builder::new()
        .name("logit-monitor".to_string())
        .spawn(move || run(&mut reconciler, &token, interval, clock_now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::sampler::ProcessObservation;
    use crate::state::SharedState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSampler {
        calls: Arc<AtomicUsize>,
        fail: bool,
        token: CancellationToken,
        stop_after: usize,
    }

    impl ProcessSampler for CountingSampler {
        fn sample(&mut self) -> Result<Vec<ProcessObservation>, String> {
            let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if calls >= self.stop_after {
                self.token.cancel();
            }
            if self.fail {
                return Err("sample unavailable".to_string());
            }
            Ok(vec![ProcessObservation {
                pid: 10,
                display_name: "Terminal".to_string(),
                is_relevant: true,
                started_at: None,
            }])
        }
    }

    fn reconciler(
        fail: bool,
        stop_after: usize,
        token: &CancellationToken,
    ) -> (tempfile::TempDir, Arc<AtomicUsize>, Reconciler<CountingSampler>) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("logit.db")).expect("db init");
        let calls = Arc::new(AtomicUsize::new(0));
        let sampler = CountingSampler {
            calls: Arc::clone(&calls),
            fail,
            token: token.clone(),
            stop_after,
        };
        let reconciler = Reconciler::new(Arc::new(SharedState::new(db)), sampler);
        (temp_dir, calls, reconciler)
    }

    #[test]
    fn loop_runs_until_cancelled_and_records_ticks() {
        let token = CancellationToken::new();
        let (_dir, calls, mut reconciler) = reconciler(false, 3, &token);

        run(&mut reconciler, &token, Duration::from_millis(5), clock_now);

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let last = reconciler.state().last_tick().expect("tick recorded");
        assert_eq!(last.sampled, 1);
        assert_eq!(reconciler.state().open_session_count(), 1);
    }

    #[test]
    fn failing_ticks_do_not_stop_the_loop() {
        let token = CancellationToken::new();
        let (_dir, calls, mut reconciler) = reconciler(true, 4, &token);

        run(&mut reconciler, &token, Duration::from_millis(5), clock_now);

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(reconciler.state().last_tick().is_none());
    }

    #[test]
    fn cancelled_token_prevents_any_tick() {
        let token = CancellationToken::new();
        token.cancel();
        let (_dir, calls, mut reconciler) = reconciler(false, 100, &token);

        run(&mut reconciler, &token, Duration::from_secs(60), clock_now);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn spawned_monitor_stops_on_cancel() {
        let token = CancellationToken::new();
        let (_dir, calls, reconciler) = reconciler(false, usize::MAX, &token);

        let handle =
            spawn_monitor(reconciler, token.clone(), Duration::from_millis(10)).expect("spawn");
        while calls.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        token.cancel();
        handle.join().expect("monitor thread joins");
    }

    #[test]
    fn clock_is_truncated_to_milliseconds() {
        let now = clock_now();
        assert_eq!(now.timestamp_subsec_nanos() % 1_000_000, 0);
    }
}
