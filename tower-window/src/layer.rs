use std::sync::Arc;
use std::time::Duration;

use tower::Layer;
use window_limit::Limiter;

use crate::service::WindowLimitService;

/// Admits requests through a shared window limiter.
#[derive(Debug)]
pub struct WindowLimitLayer<L>
where
    L: ?Sized,
{
    limiter: Arc<L>,
    timeout: Option<Duration>,
}

impl<L> Clone for WindowLimitLayer<L>
where
    L: ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            limiter: Arc::clone(&self.limiter),
            timeout: self.timeout,
        }
    }
}

impl<L> WindowLimitLayer<L>
where
    L: Limiter + ?Sized,
{
    /// Create a WindowLimitLayer
    ///
    /// Without a timeout, requests wait as long as the limiter's own default
    /// timeout allows, which may be forever.
    pub fn new(limiter: Arc<L>) -> Self {
        WindowLimitLayer {
            limiter,
            timeout: None,
        }
    }

    /// Set a unified timeout for both waiting for admission and request
    /// execution.
    ///
    /// If the total time exceeds this duration, the service
    /// will return `WindowError::Timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn limiter(&self) -> &Arc<L> {
        &self.limiter
    }
}

impl<L, S> Layer<S> for WindowLimitLayer<L>
where
    L: ?Sized,
{
    type Service = WindowLimitService<L, S>;

    fn layer(&self, service: S) -> Self::Service {
        let mut svc = WindowLimitService::new(service, self.limiter.clone());
        if let Some(timeout) = self.timeout {
            svc = svc.with_timeout(timeout);
        }
        svc
    }
}
