use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::Limiter;
use crate::LimiterKind;
use crate::MIN_SLEEP;
use crate::Permit;
use crate::config::Alignment;
use crate::config::LimiterConfig;
use crate::error::LimitError;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::metrics::MetricsSnapshot;

/// A simple window-based limiter.
///
/// Divides time into discrete windows of length `window` and admits at most
/// `capacity` callers in each. A new window opens lazily, on the first call
/// that finds the previous one expired, and every blocked caller is woken to
/// race for the fresh slots.
///
/// It can be susceptible to "boundary bursts" where double the limit is
/// allowed in a short period spanning two windows, and blocked callers are
/// not served in arrival order. Under sustained contention a blocked caller
/// can lose every race and starve indefinitely; use [`RollingWindow`] when
/// waiters must be served first come, first served.
///
/// [`RollingWindow`]: crate::RollingWindow
pub struct FixedWindow {
    config: LimiterConfig,
    /// Origin of the grid used by [`Alignment::ClockAligned`].
    anchor: Instant,
    state: Mutex<State>,
    /// Broadcast when a window opens or the limiter shuts down.
    reset: Notify,
    /// Signalled when the last blocked caller leaves.
    drained: Notify,
}

#[derive(Default)]
struct State {
    /// `None` until the first call opens a window.
    window_start: Option<Instant>,
    count: usize,
    blocked: usize,
    shutdown: bool,
    metrics: Metrics,
}

impl State {
    fn is_expired(&self, now: Instant, window: Duration) -> bool {
        self.window_start
            .is_none_or(|start| now.saturating_duration_since(start) >= window)
    }

    fn usage(&self, now: Instant, window: Duration) -> usize {
        if self.is_expired(now, window) {
            0
        } else {
            self.count
        }
    }
}

/// Tracks a caller that is sleeping until the window turns over.
struct Blocked<'a> {
    limiter: &'a FixedWindow,
}

impl<'a> Blocked<'a> {
    fn register(limiter: &'a FixedWindow, state: &mut State) -> Self {
        state.blocked += 1;
        Self { limiter }
    }
}

impl Drop for Blocked<'_> {
    fn drop(&mut self) {
        let mut state = self.limiter.state.lock();
        state.blocked -= 1;
        if state.blocked == 0 {
            self.limiter.drained.notify_waiters();
        }
    }
}

/// Counts an `acquire` that was dropped before it resolved.
struct Attempt<'a> {
    limiter: &'a FixedWindow,
    settled: bool,
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.limiter.state.lock().metrics.record_rejection();
        }
    }
}

impl FixedWindow {
    /// Creates a fixed window from a validated configuration.
    ///
    /// The purge interval has no meaning here and is ignored.
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config,
            anchor: Instant::now(),
            state: Mutex::new(State::default()),
            reset: Notify::new(),
            drained: Notify::new(),
        }
    }

    /// Admissions counted against the current window.
    pub fn count(&self) -> usize {
        self.state
            .lock()
            .usage(Instant::now(), self.config.window())
    }

    /// Callers currently sleeping until the window turns over.
    pub fn blocked(&self) -> usize {
        self.state.lock().blocked
    }

    fn aligned_start(&self, now: Instant) -> Instant {
        let window = self.config.window();
        match self.config.alignment() {
            Alignment::FirstRequest => now,
            Alignment::ClockAligned => {
                let elapsed = now.saturating_duration_since(self.anchor);
                let into_window = elapsed.as_nanos() % window.as_nanos();
                now - Duration::from_nanos(into_window as u64)
            }
        }
    }

    /// Opens a new window if the current one has expired, waking every
    /// blocked caller.
    fn roll_over(&self, state: &mut State, now: Instant) {
        let window = self.config.window();
        if !state.is_expired(now, window) {
            return;
        }
        let start = self.aligned_start(now);
        let previous = state.window_start.replace(start);
        state.count = 0;
        state.metrics.record_window_reset();
        debug!(
            alignment = ?self.config.alignment(),
            idle = ?previous.map(|previous| now.saturating_duration_since(previous + window)),
            blocked = state.blocked,
            "fixed window reset"
        );
        self.reset.notify_waiters();
    }

    /// When the current window ends, never sooner than `MIN_SLEEP` from now.
    fn next_wake(&self, state: &State, now: Instant) -> Instant {
        let end = state
            .window_start
            .map_or(now, |start| start + self.config.window());
        end.max(now + MIN_SLEEP)
    }
}

impl fmt::Debug for FixedWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedWindow")
            .field("capacity", &self.config.capacity())
            .field("window", &self.config.window())
            .field("alignment", &self.config.alignment())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Limiter for FixedWindow {
    fn kind(&self) -> LimiterKind {
        LimiterKind::Fixed
    }

    fn config(&self) -> &LimiterConfig {
        &self.config
    }

    async fn acquire_within(&self, timeout: Option<Duration>) -> Result<Permit> {
        let started = Instant::now();
        let deadline = timeout.and_then(|budget| started.checked_add(budget));
        let capacity = self.config.capacity();

        self.state.lock().metrics.record_request();
        let mut attempt = Attempt {
            limiter: self,
            settled: false,
        };
        let mut blocked = None;

        loop {
            let reset = self.reset.notified();
            tokio::pin!(reset);
            reset.as_mut().enable();

            let wake_at = {
                let mut state = self.state.lock();
                if state.shutdown {
                    attempt.settled = true;
                    state.metrics.record_rejection();
                    return Err(LimitError::Cancelled);
                }

                let now = Instant::now();
                if let Some(deadline) = deadline
                    && now >= deadline
                {
                    attempt.settled = true;
                    state.metrics.record_timeout();
                    drop(state);
                    let budget = timeout.unwrap_or_default();
                    warn!(?budget, "timed out waiting for fixed window capacity");
                    return Err(LimitError::Timeout(budget));
                }

                self.roll_over(&mut state, now);
                if state.count < capacity {
                    state.count += 1;
                    // Callers that never blocked are admitted without waiting.
                    let waited = if blocked.is_some() {
                        now.saturating_duration_since(started)
                    } else {
                        Duration::ZERO
                    };
                    state.metrics.record_success(waited);
                    attempt.settled = true;
                    trace!(count = state.count, capacity, ?waited, "admitted");
                    return Ok(Permit::new(now, waited));
                }

                if blocked.is_none() {
                    blocked = Some(Blocked::register(self, &mut state));
                }
                let wake_at = self.next_wake(&state, now);
                deadline.map_or(wake_at, |deadline| wake_at.min(deadline))
            };

            tokio::select! {
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = &mut reset => {}
            }
        }
    }

    fn can_acquire(&self) -> bool {
        let state = self.state.lock();
        let now = Instant::now();
        !state.shutdown
            && (state.is_expired(now, self.config.window())
                || state.count < self.config.capacity())
    }

    async fn wait_for_capacity(&self) -> Result<()> {
        let mut blocked = None;

        loop {
            let reset = self.reset.notified();
            tokio::pin!(reset);
            reset.as_mut().enable();

            let wake_at = {
                let mut state = self.state.lock();
                if state.shutdown {
                    return Err(LimitError::Cancelled);
                }
                let now = Instant::now();
                if state.usage(now, self.config.window()) < self.config.capacity() {
                    return Ok(());
                }
                if blocked.is_none() {
                    blocked = Some(Blocked::register(self, &mut state));
                }
                self.next_wake(&state, now)
            };

            tokio::select! {
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = &mut reset => {}
            }
        }
    }

    fn metrics(&self) -> MetricsSnapshot {
        let state = self.state.lock();
        let usage = state.usage(Instant::now(), self.config.window());
        state
            .metrics
            .snapshot(usage, self.config.capacity(), self.config.window())
    }

    fn reset_metrics(&self) {
        self.state.lock().metrics.reset();
    }

    async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now().checked_add(timeout);
        self.state.lock().shutdown = true;
        self.reset.notify_waiters();

        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            let pending = self.blocked();
            if pending == 0 {
                debug!("fixed window shut down");
                return Ok(());
            }

            let Some(deadline) = deadline else {
                drained.await;
                continue;
            };
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                let pending = self.blocked();
                if pending == 0 {
                    return Ok(());
                }
                warn!(?timeout, pending, "fixed window callers did not leave in time");
                return Err(LimitError::ShutdownTimeout { timeout, pending });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use more_asserts::assert_ge;
    use more_asserts::assert_le;
    use more_asserts::assert_lt;

    fn fixed(capacity: usize, window: Duration) -> Arc<FixedWindow> {
        Arc::new(FixedWindow::new(
            LimiterConfig::new(capacity, window).unwrap(),
        ))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn it_enforces_limits() {
        let rl = fixed(5, Duration::from_millis(500));
        let start = Instant::now();

        for _ in 0..5 {
            let permit = rl.acquire().await.unwrap();
            assert_eq!(permit.waited(), Duration::ZERO);
        }
        assert_lt!(start.elapsed(), Duration::from_millis(500));

        let err = rl
            .acquire_timeout(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err, LimitError::Timeout(Duration::from_millis(100)));
        assert_ge!(start.elapsed(), Duration::from_millis(100));
        assert_eq!(rl.count(), 5);
        assert_eq!(rl.blocked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn a_spent_budget_times_out_before_admission() {
        let rl = fixed(5, Duration::from_secs(1));
        assert_eq!(
            rl.acquire_timeout(Duration::ZERO).await,
            Err(LimitError::Timeout(Duration::ZERO))
        );
        assert_eq!(rl.count(), 0);

        let metrics = rl.metrics();
        assert_eq!(metrics.timeouts, 1);
        assert_eq!(metrics.successful_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn a_deadline_on_the_window_end_times_out() {
        let window = Duration::from_millis(100);
        let rl = fixed(1, window);
        rl.acquire().await.unwrap();

        assert_eq!(
            rl.acquire_timeout(window).await,
            Err(LimitError::Timeout(window))
        );
        assert_eq!(rl.blocked(), 0);

        let permit = rl.acquire().await.unwrap();
        assert_eq!(permit.waited(), Duration::ZERO);
        assert_eq!(rl.count(), 1);
    }

    #[tokio::test]
    async fn immediate_admissions_report_no_wait_on_a_running_clock() {
        let rl = fixed(3, Duration::from_secs(1));

        for _ in 0..3 {
            let permit = rl.acquire().await.unwrap();
            assert_eq!(permit.waited(), Duration::ZERO);
        }
        assert_eq!(rl.metrics().avg_wait_time, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn it_resets_after_the_window() {
        let rl = fixed(2, Duration::from_millis(300));
        rl.acquire().await.unwrap();
        rl.acquire().await.unwrap();
        assert_eq!(rl.metrics().windows_reset, 1);

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(rl.count(), 0);
        assert!(rl.can_acquire());

        let permit = rl.acquire().await.unwrap();
        assert_eq!(permit.waited(), Duration::ZERO);
        assert_eq!(rl.count(), 1);
        assert_eq!(rl.metrics().windows_reset, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exact_window_boundary() {
        let window = Duration::from_millis(50);
        let rl = fixed(1, window);
        let start = Instant::now();
        rl.acquire().await.unwrap();

        tokio::time::advance(Duration::from_millis(40)).await;
        assert!(!rl.can_acquire());

        let permit = rl.acquire().await.unwrap();
        assert_eq!(permit.admitted_at() - start, window);
        assert_eq!(permit.waited(), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_reset_drift() {
        let window = Duration::from_millis(10);
        let rl = fixed(1, window);
        rl.acquire().await.unwrap();

        tokio::time::advance(window * 5).await;
        let idle_start = Instant::now();
        rl.acquire().await.unwrap();

        // The new window starts at the request, not on the old schedule.
        tokio::time::advance(Duration::from_millis(5)).await;
        assert!(!rl.can_acquire());
        let permit = rl.acquire().await.unwrap();
        assert_eq!(permit.admitted_at() - idle_start, window);
    }

    #[tokio::test(start_paused = true)]
    async fn clock_aligned_windows_sit_on_a_grid() {
        let window = Duration::from_millis(100);
        let config = LimiterConfig::new(1, window)
            .unwrap()
            .with_alignment(Alignment::ClockAligned);
        let rl = FixedWindow::new(config);

        tokio::time::advance(Duration::from_millis(250)).await;
        rl.acquire().await.unwrap();

        let permit = rl.acquire().await.unwrap();
        assert_eq!(permit.admitted_at() - rl.anchor, Duration::from_millis(300));
        assert_eq!(permit.waited(), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn first_request_windows_follow_traffic() {
        let window = Duration::from_millis(100);
        let rl = fixed(1, window);

        tokio::time::advance(Duration::from_millis(250)).await;
        rl.acquire().await.unwrap();

        let permit = rl.acquire().await.unwrap();
        assert_eq!(permit.admitted_at() - rl.anchor, Duration::from_millis(350));
        assert_eq!(permit.waited(), window);
    }

    #[tokio::test(start_paused = true)]
    async fn a_reset_wakes_every_blocked_caller() {
        let window = Duration::from_millis(100);
        let rl = fixed(3, window);
        for _ in 0..3 {
            rl.acquire().await.unwrap();
        }

        let mut handles = vec![];
        for _ in 0..3 {
            let rl = Arc::clone(&rl);
            handles.push(tokio::spawn(async move { rl.acquire().await }));
        }
        settle().await;
        assert_eq!(rl.blocked(), 3);

        for result in futures::future::join_all(handles).await {
            assert_eq!(result.unwrap().unwrap().waited(), window);
        }
        assert_eq!(rl.blocked(), 0);
        assert_eq!(rl.count(), 3);
        assert_eq!(rl.metrics().windows_reset, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn it_never_exceeds_capacity_per_window() {
        let rl = fixed(2, Duration::from_millis(100));

        let mut handles = vec![];
        for _ in 0..7 {
            let rl = Arc::clone(&rl);
            handles.push(tokio::spawn(async move { rl.acquire().await }));
        }
        let mut admitted: Vec<Instant> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap().admitted_at())
            .collect();
        admitted.sort();

        for at in &admitted {
            let same_window = admitted.iter().filter(|other| *other == at).count();
            assert_le!(same_window, 2);
        }
        assert_eq!(rl.metrics().windows_reset, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_actual_concurrency() {
        let capacity = 100;
        let rl = fixed(capacity, Duration::from_secs(60));

        let mut handles = vec![];
        for _ in 0..capacity + 10 {
            let rl = Arc::clone(&rl);
            handles.push(tokio::spawn(async move {
                rl.acquire_timeout(Duration::from_millis(100)).await
            }));
        }

        let results = futures::future::join_all(handles).await;
        let success_count = results
            .iter()
            .filter(|r| matches!(r, Ok(Ok(_))))
            .count();

        // Even with multiple threads, exactly 'capacity' should pass
        assert_eq!(success_count, capacity);
        let metrics = rl.metrics();
        assert_eq!(metrics.timeouts, 10);
        assert_eq!(metrics.total_requests, (capacity + 10) as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn metrics_balance_and_reads_are_idempotent() {
        let rl = fixed(2, Duration::from_secs(1));
        rl.acquire().await.unwrap();
        rl.acquire().await.unwrap();
        let _ = rl.acquire_timeout(Duration::from_millis(10)).await;

        let first = rl.metrics();
        let second = rl.metrics();
        assert_eq!(first, second);
        assert_eq!(first.total_requests, 3);
        assert_eq!(
            first.total_requests,
            first.successful_requests + first.rejected_requests
        );
        assert_eq!(first.rejection_rate, 1.0 / 3.0);
        assert_eq!(first.current_window_usage, 2);
        assert_eq!(first.current_utilization, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_acquires_count_as_rejections() {
        let rl = fixed(1, Duration::from_secs(10));
        rl.acquire().await.unwrap();

        let abandoned = {
            let rl = Arc::clone(&rl);
            tokio::spawn(async move { rl.acquire().await })
        };
        settle().await;
        assert_eq!(rl.blocked(), 1);

        abandoned.abort();
        assert!(abandoned.await.unwrap_err().is_cancelled());
        assert_eq!(rl.blocked(), 0);
        assert_eq!(rl.count(), 1);

        let metrics = rl.metrics();
        assert_eq!(metrics.rejected_requests, 1);
        assert_eq!(metrics.timeouts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_capacity_consumes_nothing() {
        let window = Duration::from_millis(80);
        let rl = fixed(1, window);
        rl.acquire().await.unwrap();

        let start = Instant::now();
        rl.wait_for_capacity().await.unwrap();
        assert_ge!(start.elapsed(), window);
        assert!(rl.can_acquire());
        assert_eq!(rl.metrics().successful_requests, 1);
        assert_eq!(rl.metrics().windows_reset, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_blocked_callers() {
        let rl = fixed(1, Duration::from_secs(60));
        rl.acquire().await.unwrap();

        let mut handles = vec![];
        for _ in 0..3 {
            let rl = Arc::clone(&rl);
            handles.push(tokio::spawn(async move { rl.acquire().await }));
        }
        let waiter = {
            let rl = Arc::clone(&rl);
            tokio::spawn(async move { rl.wait_for_capacity().await })
        };
        settle().await;
        assert_eq!(rl.blocked(), 4);

        rl.shutdown(Duration::from_secs(1)).await.unwrap();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Err(LimitError::Cancelled));
        }
        assert_eq!(waiter.await.unwrap(), Err(LimitError::Cancelled));
        assert_eq!(rl.acquire().await, Err(LimitError::Cancelled));
        assert!(!rl.can_acquire());

        let metrics = rl.metrics();
        assert_eq!(metrics.rejected_requests, 4);
        assert_eq!(metrics.successful_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_reports_callers_that_never_leave() {
        let rl = fixed(1, Duration::from_secs(60));
        rl.acquire().await.unwrap();

        // Polled once, then never again.
        let mut stuck = rl.acquire();
        assert!(futures::poll!(stuck.as_mut()).is_pending());
        assert_eq!(rl.blocked(), 1);

        let timeout = Duration::from_millis(50);
        assert_eq!(
            rl.shutdown(timeout).await,
            Err(LimitError::ShutdownTimeout {
                timeout,
                pending: 1
            })
        );

        drop(stuck);
        assert_eq!(rl.blocked(), 0);
        assert_eq!(rl.shutdown(timeout).await, Ok(()));
    }
}
