//! # window-limit
//!
//! `window-limit` provides admission control for clients of rate limited APIs.
//!
//! A caller asks a limiter for permission before issuing an operation, and the
//! limiter blocks it until the configured budget allows the operation to run.
//! Capacity is never released by the caller; it is reclaimed by the passage of
//! time.
//!
//! ## Strategies
//!
//! * [`RollingWindow`]: at most `capacity` admissions in any interval of
//!   length `window`. Callers that cannot be admitted immediately wait in a
//!   strict FIFO queue served by a single background scheduler.
//! * [`FixedWindow`]: at most `capacity` admissions per discrete window.
//!   Blocked callers are all woken when a window resets and race for the new
//!   slots, so there is no ordering guarantee between them.
//!
//! One limiter should exist per rate limited target. [`LimiterRegistry`] hands
//! out a shared instance per host so unrelated call sites draw from the same
//! budget.
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use window_limit::Limiter;
//! use window_limit::LimiterConfig;
//! use window_limit::RollingWindow;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), window_limit::LimitError> {
//! let config = LimiterConfig::new(5, Duration::from_millis(500))?;
//! let limiter = RollingWindow::new(config);
//!
//! let permit = limiter.acquire().await?;
//! assert_eq!(permit.waited(), Duration::ZERO);
//! # Ok(())
//! # }
//! ```

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

mod combinator;
mod config;
mod error;
mod fixed_window;
mod metrics;
mod registry;
mod rolling_window;

pub use combinator::LimitFn;
pub use combinator::limit_fn;
pub use combinator::run;
pub use config::Alignment;
pub use config::LimiterConfig;
pub use config::LimiterKind;
pub use config::LimiterSettings;
pub use error::ConfigError;
pub use error::LimitError;
pub use error::Result;
pub use fixed_window::FixedWindow;
pub use metrics::MetricsSnapshot;
pub use registry::LimiterRegistry;
pub use registry::RegistryConfig;
pub use rolling_window::RollingWindow;

/// Shortest sleep a limiter will schedule, so a wake-up that lands a hair
/// before an expiry does not spin.
pub(crate) const MIN_SLEEP: Duration = Duration::from_millis(1);

/// Proof of admission.
///
/// Holding a permit does not reserve anything and dropping it releases
/// nothing: the admission stays on the limiter's books until it ages out of
/// the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    admitted_at: Instant,
    waited: Duration,
}

impl Permit {
    pub(crate) fn new(admitted_at: Instant, waited: Duration) -> Self {
        Self {
            admitted_at,
            waited,
        }
    }

    /// When the admission was recorded.
    pub fn admitted_at(&self) -> Instant {
        self.admitted_at
    }

    /// How long the caller was held before admission.
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

/// The interface shared by every limiter.
///
/// Limiters are `Send` and `Sync` and are meant to be shared through `Arc`.
#[async_trait]
pub trait Limiter: Debug + Send + Sync {
    /// Which strategy this limiter implements.
    fn kind(&self) -> LimiterKind;

    /// The configuration the limiter was built from.
    fn config(&self) -> &LimiterConfig;

    /// Waits for admission, giving up after `timeout` if one is supplied.
    ///
    /// The budget is measured from the moment of the call.
    ///
    /// # Errors
    ///
    /// [`LimitError::Timeout`] if the budget runs out and
    /// [`LimitError::Cancelled`] if the limiter shuts down first.
    async fn acquire_within(&self, timeout: Option<Duration>) -> Result<Permit>;

    /// Waits for admission using the configured default timeout, if any.
    async fn acquire(&self) -> Result<Permit> {
        self.acquire_within(self.config().default_timeout()).await
    }

    /// Waits for admission for at most `timeout`.
    async fn acquire_timeout(&self, timeout: Duration) -> Result<Permit> {
        self.acquire_within(Some(timeout)).await
    }

    /// Whether an `acquire` issued now would be admitted without waiting.
    fn can_acquire(&self) -> bool;

    /// Waits until an `acquire` would be admitted without waiting, without
    /// consuming capacity.
    async fn wait_for_capacity(&self) -> Result<()>;

    /// Current counters. Reading them changes nothing.
    fn metrics(&self) -> MetricsSnapshot;

    /// Zeroes the counters. Admission state is untouched.
    fn reset_metrics(&self);

    /// Stops admitting, cancels every blocked caller and waits up to
    /// `timeout` for background work to wind down.
    async fn shutdown(&self, timeout: Duration) -> Result<()>;
}
