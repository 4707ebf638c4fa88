use std::time::Duration;

/// Errors produced while validating limiter configuration.
///
/// These surface at construction time and are never worth retrying.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The capacity was zero or negative.
    #[error("limit must be a positive integer")]
    InvalidLimit,

    /// The window was zero, negative or not a finite number.
    #[error("window must be a positive number of seconds")]
    InvalidWindow,

    /// An optional duration setting could not be turned into a `Duration`.
    #[error("{field} is not a valid number of seconds")]
    InvalidDuration {
        /// The name of the offending setting.
        field: &'static str,
    },

    /// A settings document could not be parsed.
    #[error("failed to parse limiter configuration: {0}")]
    Parse(String),

    /// A settings file could not be read.
    #[error("failed to read limiter configuration: {0}")]
    Io(String),
}

/// Errors returned by limiter operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimitError {
    /// The limiter could not be built.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No capacity became available within the caller's budget.
    ///
    /// The duration is the budget that was exhausted.
    #[error("timed out after {0:?} waiting for rate limit capacity")]
    Timeout(Duration),

    /// The limiter is shutting down and will not admit this caller.
    #[error("rate limiter is shutting down")]
    Cancelled,

    /// `shutdown` could not drain outstanding waiters in time.
    #[error("shutdown did not complete within {timeout:?}; {pending} waiters outstanding")]
    ShutdownTimeout {
        /// The budget given to `shutdown`.
        timeout: Duration,
        /// Callers still blocked when the budget ran out.
        pending: usize,
    },
}

/// Result type alias for limiter operations.
pub type Result<T, E = LimitError> = std::result::Result<T, E>;
