//! Limiter configuration.
//!
//! [`LimiterConfig`] is the validated form every limiter is built from.
//! [`LimiterSettings`] is its serialisable twin, with durations expressed as
//! float seconds so they can live in YAML files next to connector settings.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::FixedWindow;
use crate::Limiter;
use crate::RollingWindow;
use crate::error::ConfigError;

/// How a fixed window chooses its start when a new window opens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alignment {
    /// The window opens at the first request after the previous one expired.
    #[default]
    FirstRequest,
    /// Windows sit on a grid of `window`-sized slots measured from the
    /// limiter's creation.
    ClockAligned,
}

/// Which limiter variant to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterKind {
    /// A continuously sliding window with a FIFO waiter queue.
    #[default]
    Rolling,
    /// Discrete windows that reset completely at each boundary.
    Fixed,
}

impl LimiterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimiterKind::Rolling => "rolling",
            LimiterKind::Fixed => "fixed",
        }
    }
}

/// Validated limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterConfig {
    capacity: usize,
    window: Duration,
    alignment: Alignment,
    purge_interval: Option<Duration>,
    default_timeout: Option<Duration>,
}

impl LimiterConfig {
    /// Creates a configuration allowing `capacity` operations per `window`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidLimit`] if `capacity` is zero and
    /// [`ConfigError::InvalidWindow`] if `window` is zero.
    pub fn new(capacity: usize, window: Duration) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::InvalidLimit);
        }
        if window.is_zero() {
            return Err(ConfigError::InvalidWindow);
        }
        Ok(Self {
            capacity,
            window,
            alignment: Alignment::default(),
            purge_interval: None,
            default_timeout: None,
        })
    }

    /// Creates a configuration from loosely typed inputs, as found in
    /// settings files.
    pub fn from_secs_f64(limit: i64, window_secs: f64) -> Result<Self, ConfigError> {
        let capacity = usize::try_from(limit)
            .ok()
            .filter(|capacity| *capacity > 0)
            .ok_or(ConfigError::InvalidLimit)?;
        let window = positive_secs(window_secs).ok_or(ConfigError::InvalidWindow)?;
        Self::new(capacity, window)
    }

    /// Sets the fixed window alignment. Rolling windows ignore it.
    pub fn with_alignment(mut self, alignment: Alignment) -> Self {
        self.alignment = alignment;
        self
    }

    /// Sets how often an idle rolling window trims expired admissions.
    pub fn with_purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval = Some(interval);
        self
    }

    /// Sets the budget used by `acquire` when the caller gives none.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn alignment(&self) -> Alignment {
        self.alignment
    }

    pub fn purge_interval(&self) -> Option<Duration> {
        self.purge_interval
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }
}

/// Serialisable limiter settings.
///
/// ```rust
/// use window_limit::LimiterSettings;
///
/// let settings: LimiterSettings = serde_yaml::from_str(
///     "kind: fixed\nlimit: 40\nwindow_secs: 1.5\nalignment: clock_aligned\n",
/// )
/// .unwrap();
/// let config = settings.to_config().unwrap();
/// assert_eq!(config.capacity(), 40);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Limiter variant
    #[serde(default)]
    pub kind: LimiterKind,

    /// Operations allowed per window
    #[serde(default = "default_limit")]
    pub limit: i64,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: f64,

    /// Fixed window alignment
    #[serde(default)]
    pub alignment: Alignment,

    /// Idle purge cadence in seconds
    #[serde(default)]
    pub purge_interval_secs: Option<f64>,

    /// Budget for `acquire` calls that pass none, in seconds
    #[serde(default)]
    pub default_timeout_secs: Option<f64>,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            kind: LimiterKind::default(),
            limit: default_limit(),
            window_secs: default_window_secs(),
            alignment: Alignment::default(),
            purge_interval_secs: None,
            default_timeout_secs: None,
        }
    }
}

fn default_limit() -> i64 {
    60
}

fn default_window_secs() -> f64 {
    60.0
}

impl LimiterSettings {
    /// Validates these settings.
    pub fn to_config(&self) -> Result<LimiterConfig, ConfigError> {
        let mut config = LimiterConfig::from_secs_f64(self.limit, self.window_secs)?
            .with_alignment(self.alignment);
        if let Some(secs) = self.purge_interval_secs {
            let interval = positive_secs(secs).ok_or(ConfigError::InvalidDuration {
                field: "purge_interval_secs",
            })?;
            config = config.with_purge_interval(interval);
        }
        if let Some(secs) = self.default_timeout_secs {
            let timeout = Duration::try_from_secs_f64(secs).map_err(|_| {
                ConfigError::InvalidDuration {
                    field: "default_timeout_secs",
                }
            })?;
            config = config.with_default_timeout(timeout);
        }
        Ok(config)
    }

    /// Builds the limiter these settings describe.
    ///
    /// Rolling windows with a purge interval spawn their janitor here, so
    /// call this from within a tokio runtime.
    pub fn build(&self) -> Result<Arc<dyn Limiter>, ConfigError> {
        let config = self.to_config()?;
        Ok(match self.kind {
            LimiterKind::Rolling => Arc::new(RollingWindow::new(config)),
            LimiterKind::Fixed => Arc::new(FixedWindow::new(config)),
        })
    }
}

fn positive_secs(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|duration| !duration.is_zero())
}
