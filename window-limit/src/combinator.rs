use std::future::Future;
use std::sync::Arc;

use crate::Limiter;
use crate::error::Result;

/// Waits for admission, then drives `operation` to completion.
///
/// `operation` is not polled unless the caller is admitted.
pub async fn run<L, F>(limiter: &L, operation: F) -> Result<F::Output>
where
    L: Limiter + ?Sized,
    F: Future,
{
    limiter.acquire().await?;
    Ok(operation.await)
}

/// Wraps `operation` so every call first waits for admission from `limiter`.
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use window_limit::LimiterConfig;
/// use window_limit::RollingWindow;
/// use window_limit::limit_fn;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), window_limit::LimitError> {
/// let limiter = Arc::new(RollingWindow::new(LimiterConfig::new(
///     10,
///     Duration::from_secs(1),
/// )?));
/// let double = limit_fn(limiter, |n: u32| async move { n * 2 });
///
/// assert_eq!(double.call(21).await?, 42);
/// # Ok(())
/// # }
/// ```
pub fn limit_fn<L, F>(limiter: Arc<L>, operation: F) -> LimitFn<L, F>
where
    L: Limiter + ?Sized,
{
    LimitFn { limiter, operation }
}

/// An operation guarded by a limiter. See [`limit_fn`].
pub struct LimitFn<L: ?Sized, F> {
    limiter: Arc<L>,
    operation: F,
}

impl<L: ?Sized, F: Clone> Clone for LimitFn<L, F> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            operation: self.operation.clone(),
        }
    }
}

impl<L, F> LimitFn<L, F>
where
    L: Limiter + ?Sized,
{
    /// Waits for admission, then calls the operation with `args`.
    pub async fn call<A, Fut>(&self, args: A) -> Result<Fut::Output>
    where
        F: Fn(A) -> Fut,
        Fut: Future,
    {
        self.limiter.acquire().await?;
        Ok((self.operation)(args).await)
    }

    pub fn limiter(&self) -> &Arc<L> {
        &self.limiter
    }
}
