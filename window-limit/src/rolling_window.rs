use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::error;
use tracing::trace;
use tracing::warn;

use crate::Limiter;
use crate::LimiterKind;
use crate::MIN_SLEEP;
use crate::Permit;
use crate::config::LimiterConfig;
use crate::error::LimitError;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::metrics::MetricsSnapshot;

/// A Rolling Window implementation.
///
/// Every admission is recorded as a timestamp, and at most `capacity`
/// timestamps may be younger than `window` at any instant. Callers that
/// cannot be admitted straight away join a FIFO queue; a single scheduler
/// task serves the queue head each time the oldest admission ages out.
///
/// The first caller to join the queue is always the first to leave it, and a
/// new caller never overtakes a live queued one.
pub struct RollingWindow {
    shared: Arc<Shared>,
}

struct Shared {
    config: LimiterConfig,
    state: Mutex<State>,
    /// Wakes the scheduler and capacity waiters on shutdown, or when an
    /// admission is withdrawn.
    wake: Notify,
    #[cfg(test)]
    fail_next_pass: std::sync::atomic::AtomicBool,
}

#[derive(Default)]
struct State {
    /// Admission timestamps, oldest first.
    ledger: VecDeque<Instant>,
    queue: VecDeque<Waiter>,
    scheduler_running: bool,
    scheduler: Option<JoinHandle<()>>,
    janitor: Option<JoinHandle<()>>,
    shutdown: bool,
    metrics: Metrics,
}

struct Waiter {
    tx: oneshot::Sender<Result<Permit>>,
    enqueued_at: Instant,
}

impl Waiter {
    /// A waiter whose caller timed out or went away is inert.
    fn is_live(&self) -> bool {
        !self.tx.is_closed()
    }
}

impl State {
    /// Drops every admission at least `window` old.
    fn purge(&mut self, now: Instant, window: Duration) {
        while self
            .ledger
            .front()
            .is_some_and(|admitted| now.saturating_duration_since(*admitted) >= window)
        {
            self.ledger.pop_front();
        }
    }

    /// Admissions younger than `window`, without mutating the ledger.
    fn usage(&self, now: Instant, window: Duration) -> usize {
        let expired = self
            .ledger
            .partition_point(|admitted| now.saturating_duration_since(*admitted) >= window);
        self.ledger.len() - expired
    }

    fn has_live_waiters(&self) -> bool {
        self.queue.iter().any(Waiter::is_live)
    }

    fn pending(&self) -> usize {
        self.queue.iter().filter(|waiter| waiter.is_live()).count()
    }

    /// Hands the head of the queue an admission taken at `now`.
    ///
    /// The receiving caller does the accounting.
    fn admit_head(&mut self, now: Instant) {
        let Some(waiter) = self.queue.pop_front() else {
            return;
        };
        let waited = now.saturating_duration_since(waiter.enqueued_at);
        self.ledger.push_back(now);
        if waiter.tx.send(Ok(Permit::new(now, waited))).is_ok() {
            trace!(?waited, "admitted queued caller");
        } else {
            // The caller left between the liveness check and the send.
            self.ledger.pop_back();
        }
    }

    /// Removes an admission whose caller never collected it.
    fn withdraw(&mut self, admitted_at: Instant) {
        if let Some(position) = self.ledger.iter().rposition(|at| *at == admitted_at) {
            self.ledger.remove(position);
        }
    }

    fn cancel_all(&mut self) -> usize {
        let mut cancelled = 0;
        while let Some(waiter) = self.queue.pop_front() {
            if waiter.tx.send(Err(LimitError::Cancelled)).is_ok() {
                cancelled += 1;
            }
        }
        cancelled
    }
}

impl Shared {
    fn ensure_scheduler(self: &Arc<Self>, state: &mut State) {
        if state.scheduler_running {
            return;
        }
        state.scheduler_running = true;
        debug!(
            capacity = self.config.capacity(),
            window = ?self.config.window(),
            "starting rolling window scheduler"
        );
        state.scheduler = Some(tokio::spawn(Arc::clone(self).supervise()));
    }

    /// Runs the scheduler, restarting it if a pass panics while callers are
    /// still queued.
    async fn supervise(self: Arc<Self>) {
        loop {
            let worker = tokio::spawn(Arc::clone(&self).serve_queue());
            let Err(err) = worker.await else {
                return;
            };

            let mut state = self.state.lock();
            if err.is_panic() {
                state.metrics.record_error();
                error!(error = %err, "rolling window scheduler failed");
            }
            state.queue.retain(Waiter::is_live);
            if !err.is_panic() || state.shutdown || state.queue.is_empty() {
                state.scheduler_running = false;
                return;
            }
            debug!(
                pending = state.queue.len(),
                "restarting rolling window scheduler"
            );
        }
    }

    async fn serve_queue(self: Arc<Self>) {
        let capacity = self.config.capacity();
        let window = self.config.window();

        loop {
            let wake = self.wake.notified();
            tokio::pin!(wake);
            wake.as_mut().enable();

            let wake_at = {
                let mut state = self.state.lock();
                if state.shutdown {
                    state.scheduler_running = false;
                    return;
                }
                #[cfg(test)]
                self.maybe_fail();

                let now = Instant::now();
                state.purge(now, window);
                while state.queue.front().is_some_and(|waiter| !waiter.is_live()) {
                    state.queue.pop_front();
                }
                if state.queue.is_empty() {
                    state.scheduler_running = false;
                    debug!("rolling window queue drained; scheduler exiting");
                    return;
                }
                if state.ledger.len() < capacity {
                    state.admit_head(now);
                    continue;
                }
                match state.ledger.front() {
                    Some(oldest) => (*oldest + window).max(now + MIN_SLEEP),
                    None => now + MIN_SLEEP,
                }
            };

            tokio::select! {
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = &mut wake => {}
            }
        }
    }

    #[cfg(test)]
    fn maybe_fail(&self) {
        use std::sync::atomic::Ordering;

        if self.fail_next_pass.swap(false, Ordering::SeqCst) {
            panic!("injected scheduler failure");
        }
    }
}

/// Trims expired admissions while the limiter sits idle.
async fn purge_idle(shared: Weak<Shared>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let mut state = shared.state.lock();
        if state.shutdown {
            return;
        }
        let before = state.ledger.len();
        state.purge(Instant::now(), shared.config.window());
        if state.ledger.len() < before {
            trace!(purged = before - state.ledger.len(), "purged expired admissions");
        }
        if state.ledger.is_empty() {
            state.ledger.shrink_to_fit();
        }
    }
}

/// A queued caller's end of the hand-off.
///
/// Dropping it before it settles counts a rejection, and gives back any
/// admission the scheduler made on the caller's behalf.
struct Pending<'a> {
    shared: &'a Shared,
    rx: oneshot::Receiver<Result<Permit>>,
    settled: bool,
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.shared.state.lock();
        self.rx.close();
        if let Ok(Ok(permit)) = self.rx.try_recv() {
            state.withdraw(permit.admitted_at());
            self.shared.wake.notify_waiters();
        }
        state.metrics.record_rejection();
    }
}

impl RollingWindow {
    /// Creates a rolling window from a validated configuration.
    ///
    /// If the configuration has a purge interval and a tokio runtime is
    /// available, an idle purge task is started.
    pub fn new(config: LimiterConfig) -> Self {
        let purge_interval = config.purge_interval();
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(State::default()),
            wake: Notify::new(),
            #[cfg(test)]
            fail_next_pass: Default::default(),
        });

        if let Some(every) = purge_interval {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let janitor = handle.spawn(purge_idle(Arc::downgrade(&shared), every));
                    shared.state.lock().janitor = Some(janitor);
                }
                Err(_) => warn!(
                    ?every,
                    "no tokio runtime; rolling window idle purge disabled"
                ),
            }
        }

        Self { shared }
    }

    /// Callers currently waiting in the queue.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().pending()
    }

    /// Admissions currently held in the ledger, expired or not.
    pub fn ledger_len(&self) -> usize {
        self.shared.state.lock().ledger.len()
    }

    #[cfg(test)]
    fn fail_next_pass(&self) {
        use std::sync::atomic::Ordering;

        self.shared.fail_next_pass.store(true, Ordering::SeqCst);
    }
}

impl Drop for RollingWindow {
    fn drop(&mut self) {
        if let Some(janitor) = self.shared.state.lock().janitor.take() {
            janitor.abort();
        }
    }
}

impl fmt::Debug for RollingWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RollingWindow")
            .field("capacity", &self.shared.config.capacity())
            .field("window", &self.shared.config.window())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Limiter for RollingWindow {
    fn kind(&self) -> LimiterKind {
        LimiterKind::Rolling
    }

    fn config(&self) -> &LimiterConfig {
        &self.shared.config
    }

    async fn acquire_within(&self, timeout: Option<Duration>) -> Result<Permit> {
        let started = Instant::now();
        let capacity = self.shared.config.capacity();
        let window = self.shared.config.window();

        let rx = {
            let mut state = self.shared.state.lock();
            state.metrics.record_request();
            if state.shutdown {
                state.metrics.record_rejection();
                return Err(LimitError::Cancelled);
            }

            let now = Instant::now();
            state.purge(now, window);
            state.queue.retain(Waiter::is_live);
            if state.queue.is_empty() && state.ledger.len() < capacity {
                state.ledger.push_back(now);
                state.metrics.record_success(Duration::ZERO);
                trace!(usage = state.ledger.len(), capacity, "admitted");
                return Ok(Permit::new(now, Duration::ZERO));
            }

            let (tx, rx) = oneshot::channel();
            state.queue.push_back(Waiter {
                tx,
                enqueued_at: started,
            });
            trace!(pending = state.queue.len(), "queued for admission");
            self.shared.ensure_scheduler(&mut state);
            rx
        };

        let mut pending = Pending {
            shared: &self.shared,
            rx,
            settled: false,
        };

        let deadline = timeout.and_then(|budget| started.checked_add(budget));
        let received = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, &mut pending.rx)
                .await
                .ok(),
            None => Some((&mut pending.rx).await),
        };

        let mut state = self.shared.state.lock();
        pending.settled = true;
        let result = match received {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(LimitError::Cancelled),
            None => {
                // An admission may have landed while the timer fired.
                pending.rx.close();
                match pending.rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(LimitError::Timeout(timeout.unwrap_or_default())),
                }
            }
        };
        match &result {
            Ok(permit) => state.metrics.record_success(permit.waited()),
            Err(LimitError::Timeout(_)) => state.metrics.record_timeout(),
            Err(_) => state.metrics.record_rejection(),
        }
        drop(state);

        if let Err(LimitError::Timeout(budget)) = &result {
            warn!(?budget, "timed out waiting for rolling window capacity");
        }
        result
    }

    fn can_acquire(&self) -> bool {
        let state = self.shared.state.lock();
        !state.shutdown
            && !state.has_live_waiters()
            && state.usage(Instant::now(), self.shared.config.window())
                < self.shared.config.capacity()
    }

    async fn wait_for_capacity(&self) -> Result<()> {
        let capacity = self.shared.config.capacity();
        let window = self.shared.config.window();

        loop {
            let wake = self.shared.wake.notified();
            tokio::pin!(wake);
            wake.as_mut().enable();

            let wake_at = {
                let state = self.shared.state.lock();
                if state.shutdown {
                    return Err(LimitError::Cancelled);
                }
                let now = Instant::now();
                let usage = state.usage(now, window);
                if usage < capacity && !state.has_live_waiters() {
                    return Ok(());
                }
                let oldest = state.ledger.len() - usage;
                match state.ledger.get(oldest) {
                    Some(admitted) if usage >= capacity => {
                        (*admitted + window).max(now + MIN_SLEEP)
                    }
                    // Capacity is free but queued callers come first.
                    _ => now + MIN_SLEEP,
                }
            };

            tokio::select! {
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = &mut wake => {}
            }
        }
    }

    fn metrics(&self) -> MetricsSnapshot {
        let state = self.shared.state.lock();
        let config = &self.shared.config;
        let usage = state.usage(Instant::now(), config.window());
        state
            .metrics
            .snapshot(usage, config.capacity(), config.window())
    }

    fn reset_metrics(&self) {
        self.shared.state.lock().metrics.reset();
    }

    async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let (scheduler, janitor) = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            let cancelled = state.cancel_all();
            if cancelled > 0 {
                warn!(cancelled, "rolling window shutdown cancelled queued callers");
            }
            (state.scheduler.take(), state.janitor.take())
        };
        self.shared.wake.notify_waiters();

        if let Some(janitor) = janitor {
            janitor.abort();
        }
        if let Some(scheduler) = scheduler {
            let abort = scheduler.abort_handle();
            if tokio::time::timeout(timeout, scheduler).await.is_err() {
                abort.abort();
                let pending = self.pending();
                warn!(?timeout, pending, "rolling window scheduler did not stop in time");
                return Err(LimitError::ShutdownTimeout { timeout, pending });
            }
        }
        debug!("rolling window shut down");
        Ok(())
    }
}
