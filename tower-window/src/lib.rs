//! # Tower Window
//!
//! `tower-window` puts a [`window_limit`] limiter in front of any
//! [Tower](https://github.com/tower-rs/tower) service.
//!
//! [`WindowLimitLayer`] admits each request through a shared [`Limiter`]
//! before the inner service sees it. Admission happens in `poll_ready`, so a
//! full limiter shows up as backpressure rather than as an error:
//!
//! 1. **Waiting**: a request waits for the limiter, in FIFO order for a
//!    rolling window and in no particular order for a fixed window.
//! 2. **Timeouts**: with [`WindowLimitLayer::with_timeout`], the wait and the
//!    inner call share one budget, and running out of it fails the request
//!    with [`WindowError::Timeout`].
//! 3. **Error Mapping**: limiter failures surface as a cloneable
//!    [`WindowError`] inside the `tower::BoxError`.
//!
//! Admissions and throttled requests are counted through `opentelemetry`
//! (`window_limit.admitted` and `window_limit.throttled`).
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use tower::ServiceBuilder;
//! use tower::ServiceExt;
//! use tower_window::ServiceBuilderExt;
//! use window_limit::Limiter;
//! use window_limit::LimiterConfig;
//! use window_limit::RollingWindow;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), tower::BoxError> {
//! let limiter: Arc<dyn Limiter> =
//!     Arc::new(RollingWindow::new(LimiterConfig::new(10, Duration::from_secs(1))?));
//!
//! let svc = ServiceBuilder::new()
//!     .window_limit_timeout(limiter, Duration::from_millis(250))
//!     .service(tower::service_fn(|name: &'static str| async move {
//!         Ok::<_, tower::BoxError>(format!("hello {name}"))
//!     }));
//!
//! assert_eq!(svc.oneshot("world").await?, "hello world");
//! # Ok(())
//! # }
//! ```

mod error;
mod layer;
mod service;
mod utils;


#[cfg(doc)]
use window_limit::Limiter;

pub use error::WindowError;
pub use layer::WindowLimitLayer;
pub use service::ResponseFuture;
pub use service::WindowLimitService;
pub use utils::ServiceBuilderExt;
pub use utils::make_limited_svc;
