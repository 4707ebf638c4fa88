use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::task::ready;
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use pin_project_lite::pin_project;
use tokio::time::Sleep;
use tokio::time::sleep;
use tower::BoxError;
use tower::Service;
use tracing::debug;
use tracing::trace;
use window_limit::Limiter;
use window_limit::Permit;

use crate::error::WindowError;

type Acquiring = Pin<Box<dyn Future<Output = window_limit::Result<Permit>> + Send>>;

#[derive(Clone, Debug)]
struct WindowLimitMetrics {
    admitted: Counter<u64>,
    throttled: Counter<u64>,
}

/// Waits for admission from a [`Limiter`] before calling the inner service.
///
/// Admission happens in `poll_ready`, so the service applies backpressure
/// while the limiter is full. Every clone shares the limiter but waits on its
/// own.
pub struct WindowLimitService<L, S>
where
    L: ?Sized,
{
    inner: S,
    limiter: Arc<L>,
    timeout: Option<Duration>,
    acquiring: Option<Acquiring>,
    permit: Option<Permit>,
    instruments: WindowLimitMetrics,
}

pin_project! {
    /// A future that bounds the inner service future by what is left of the
    /// layer's timeout.
    #[project = ResponseProj]
    pub enum ResponseFuture<F> {
        Called {
            #[pin]
            inner: F,
            #[pin]
            deadline: Option<Sleep>,
            budget: Duration,
        },
        NotReady,
    }
}

impl<F, T> Future for ResponseFuture<F>
where
    F: Future<Output = Result<T, BoxError>>,
{
    type Output = Result<T, BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project() {
            ResponseProj::Called {
                inner,
                deadline,
                budget,
            } => {
                if let Poll::Ready(res) = inner.poll(cx) {
                    return Poll::Ready(res);
                }
                match deadline.as_pin_mut() {
                    Some(deadline) => {
                        ready!(deadline.poll(cx));
                        Poll::Ready(Err(Box::new(WindowError::Timeout(*budget))))
                    }
                    None => Poll::Pending,
                }
            }
            ResponseProj::NotReady => Poll::Ready(Err(Box::new(WindowError::Inner(
                "called before poll_ready admitted the request".to_string(),
            )))),
        }
    }
}

// Manually implement Clone because an in-flight acquisition cannot be cloned
impl<L, S> Clone for WindowLimitService<L, S>
where
    L: ?Sized,
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: Arc::clone(&self.limiter),
            // We start with a fresh admission state for the new clone
            acquiring: None,
            permit: None,
            timeout: self.timeout,
            instruments: self.instruments.clone(),
        }
    }
}

impl<L, S> std::fmt::Debug for WindowLimitService<L, S>
where
    L: std::fmt::Debug + ?Sized,
    S: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowLimitService")
            .field("inner", &self.inner)
            .field("limiter", &self.limiter)
            .field("timeout", &self.timeout)
            .field("acquiring", &self.acquiring.is_some())
            .field("permit", &self.permit)
            .finish()
    }
}

fn acquire<L>(limiter: Arc<L>, timeout: Option<Duration>) -> Acquiring
where
    L: Limiter + ?Sized + 'static,
{
    Box::pin(async move {
        let timeout = timeout.or(limiter.config().default_timeout());
        limiter.acquire_within(timeout).await
    })
}

impl<L, S, Req> Service<Req> for WindowLimitService<L, S>
where
    L: Limiter + ?Sized + 'static,
    S: Service<Req, Error = BoxError>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // 1. Check inner service readiness FIRST so a busy service does not
        // consume admissions
        ready!(self.inner.poll_ready(cx))?;

        if self.permit.is_some() {
            return Poll::Ready(Ok(()));
        }

        // 2. Drive the acquisition, starting one if needed
        let acquiring = self
            .acquiring
            .get_or_insert_with(|| acquire(Arc::clone(&self.limiter), self.timeout));
        let result = ready!(acquiring.as_mut().poll(cx));
        self.acquiring = None;

        let strategy = KeyValue::new("strategy", self.limiter.kind().as_str());
        match result {
            Ok(permit) => {
                self.instruments.admitted.add(1, &[strategy]);
                trace!(waited = ?permit.waited(), "request admitted");
                self.permit = Some(permit);
                Poll::Ready(Ok(()))
            }
            Err(err) => {
                let err = WindowError::from(err);
                let reason = match err {
                    WindowError::Timeout(_) => "timeout",
                    WindowError::Cancelled => "cancelled",
                    WindowError::Inner(_) => "error",
                };
                self.instruments
                    .throttled
                    .add(1, &[strategy, KeyValue::new("reason", reason)]);
                debug!(error = %err, "request throttled");
                Poll::Ready(Err(Box::new(err)))
            }
        }
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let Some(permit) = self.permit.take() else {
            return ResponseFuture::NotReady;
        };
        let budget = self.timeout.unwrap_or_default();
        let deadline = self
            .timeout
            .map(|budget| sleep(budget.saturating_sub(permit.waited())));

        ResponseFuture::Called {
            inner: self.inner.call(req),
            deadline,
            budget,
        }
    }
}

impl<L, S> WindowLimitService<L, S>
where
    L: ?Sized,
{
    pub fn new(inner: S, limiter: Arc<L>) -> Self {
        let meter = global::meter("window_limit_service");
        let instruments = WindowLimitMetrics {
            admitted: meter.u64_counter("window_limit.admitted").build(),
            throttled: meter.u64_counter("window_limit.throttled").build(),
        };

        Self {
            inner,
            limiter,
            timeout: None,
            acquiring: None,
            permit: None,
            instruments,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn limiter(&self) -> &Arc<L> {
        &self.limiter
    }
}
