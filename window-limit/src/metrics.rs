use std::time::Duration;

use serde::Serialize;

/// Counters accumulated by a limiter.
///
/// Always mutated under the owning limiter's lock.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct Metrics {
    total_requests: u64,
    successful_requests: u64,
    rejected_requests: u64,
    timeouts: u64,
    errors: u64,
    windows_reset: u64,
    total_wait: Duration,
}

impl Metrics {
    pub(crate) fn record_request(&mut self) {
        self.total_requests += 1;
    }

    pub(crate) fn record_success(&mut self, waited: Duration) {
        self.successful_requests += 1;
        self.total_wait = self.total_wait.saturating_add(waited);
    }

    pub(crate) fn record_timeout(&mut self) {
        self.timeouts += 1;
        self.rejected_requests += 1;
    }

    /// A caller that gave up or was cancelled without timing out.
    pub(crate) fn record_rejection(&mut self) {
        self.rejected_requests += 1;
    }

    pub(crate) fn record_error(&mut self) {
        self.errors += 1;
    }

    pub(crate) fn record_window_reset(&mut self) {
        self.windows_reset += 1;
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn snapshot(
        &self,
        usage: usize,
        capacity: usize,
        window: Duration,
    ) -> MetricsSnapshot {
        let rejection_rate = if self.total_requests == 0 {
            0.0
        } else {
            self.rejected_requests as f64 / self.total_requests as f64
        };
        let avg_wait_time = if self.successful_requests == 0 {
            Duration::ZERO
        } else {
            self.total_wait.div_f64(self.successful_requests as f64)
        };

        MetricsSnapshot {
            total_requests: self.total_requests,
            successful_requests: self.successful_requests,
            rejected_requests: self.rejected_requests,
            timeouts: self.timeouts,
            errors: self.errors,
            windows_reset: self.windows_reset,
            total_wait_time: self.total_wait,
            avg_wait_time,
            current_window_usage: usage,
            current_utilization: usage as f64 / capacity as f64,
            rejection_rate,
            capacity,
            window,
        }
    }
}

/// A point-in-time view of a limiter's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Calls to `acquire`
    pub total_requests: u64,
    /// Calls that were admitted
    pub successful_requests: u64,
    /// Calls that timed out, were cancelled or were abandoned
    pub rejected_requests: u64,
    /// Calls that ran out of budget
    pub timeouts: u64,
    /// Internal scheduler failures
    pub errors: u64,
    /// Fixed window resets
    pub windows_reset: u64,
    /// Total time admitted callers spent waiting
    pub total_wait_time: Duration,
    /// Mean wait of admitted callers
    pub avg_wait_time: Duration,
    /// Admissions counted against the current window
    pub current_window_usage: usize,
    /// `current_window_usage / capacity`
    pub current_utilization: f64,
    /// `rejected_requests / total_requests`
    pub rejection_rate: f64,
    pub capacity: usize,
    pub window: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_snapshot_has_no_rates() {
        let metrics = Metrics::default();
        let snapshot = metrics.snapshot(0, 10, Duration::from_secs(1));

        assert_eq!(snapshot.total_requests, 0);
        assert_eq!(snapshot.rejection_rate, 0.0);
        assert_eq!(snapshot.avg_wait_time, Duration::ZERO);
        assert_eq!(snapshot.current_utilization, 0.0);
    }

    #[test]
    fn rates_follow_counters() {
        let mut metrics = Metrics::default();
        for _ in 0..4 {
            metrics.record_request();
        }
        metrics.record_success(Duration::ZERO);
        metrics.record_success(Duration::from_millis(100));
        metrics.record_timeout();
        metrics.record_rejection();

        let snapshot = metrics.snapshot(2, 4, Duration::from_secs(1));
        assert_eq!(
            snapshot.total_requests,
            snapshot.successful_requests + snapshot.rejected_requests
        );
        assert_eq!(snapshot.timeouts, 1);
        assert_eq!(snapshot.rejection_rate, 0.5);
        assert_eq!(snapshot.avg_wait_time, Duration::from_millis(50));
        assert_eq!(snapshot.current_utilization, 0.5);
    }

    #[test]
    fn reset_clears_everything() {
        let mut metrics = Metrics::default();
        metrics.record_request();
        metrics.record_error();
        metrics.record_window_reset();
        metrics.reset();
        assert_eq!(metrics, Metrics::default());
    }
}
