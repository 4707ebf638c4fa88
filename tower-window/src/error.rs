use std::time::Duration;

use tower::BoxError;
use window_limit::LimitError;

/// Errors produced by the window limit middleware.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowError {
    /// No capacity became available within the layer's timeout, or the inner
    /// call used up what was left of it.
    #[error("Request timed out after {0:?} waiting for rate limit capacity")]
    Timeout(Duration),

    /// The limiter was shut down while the request waited.
    #[error("Rate limiter is shutting down; request cancelled")]
    Cancelled,

    /// An unexpected error occurred in the limiter or the inner service.
    ///
    /// The string contains the `Display` representation of the error.
    #[error("Internal service error: {0}")]
    Inner(String),
}

impl From<LimitError> for WindowError {
    fn from(err: LimitError) -> Self {
        match err {
            LimitError::Timeout(budget) => Self::Timeout(budget),
            LimitError::Cancelled => Self::Cancelled,
            other => Self::Inner(other.to_string()),
        }
    }
}

impl WindowError {
    /// Recovers a `WindowError` from the boxed error a service returned.
    ///
    /// Errors that did not come from this crate become [`WindowError::Inner`].
    pub fn from_boxed(err: BoxError) -> Self {
        match err.downcast::<WindowError>() {
            Ok(err) => *err,
            Err(err) => match err.downcast::<LimitError>() {
                Ok(err) => Self::from(*err),
                Err(err) => Self::Inner(err.to_string()),
            },
        }
    }
}
