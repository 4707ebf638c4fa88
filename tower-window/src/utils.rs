use std::sync::Arc;
use std::time::Duration;

use tower::BoxError;
use tower::Service;
use tower::ServiceBuilder;
use tower::layer::util::Stack;
use tower::util::BoxCloneService;
use window_limit::Limiter;

use crate::WindowLimitLayer;

/// Admit requests through `limiter`, with a single unified timeout covering
/// both the wait for admission and the inner call.
pub fn make_limited_svc<V, Req, Resp>(
    limiter: Arc<dyn Limiter>,
    timeout: Duration,
    svc: V,
) -> BoxCloneService<Req, Resp, BoxError>
where
    Req: 'static,
    V: Service<Req, Response = Resp, Error = BoxError> + Clone + Send + 'static,
    <V as Service<Req>>::Future: Send,
{
    BoxCloneService::new(
        ServiceBuilder::new()
            .layer(WindowLimitLayer::new(limiter).with_timeout(timeout))
            .service(svc),
    )
}

/// Service Builder Extension with additional useful functions for tower::ServiceBuilder.
pub trait ServiceBuilderExt<L> {
    /// Add a window limit layer that waits as long as the limiter allows
    fn window_limit(
        self,
        limiter: Arc<dyn Limiter>,
    ) -> ServiceBuilder<Stack<WindowLimitLayer<dyn Limiter>, L>>;

    /// Add a window limit layer with a unified timeout
    fn window_limit_timeout(
        self,
        limiter: Arc<dyn Limiter>,
        timeout: Duration,
    ) -> ServiceBuilder<Stack<WindowLimitLayer<dyn Limiter>, L>>;
}

impl<L> ServiceBuilderExt<L> for ServiceBuilder<L> {
    fn window_limit(
        self,
        limiter: Arc<dyn Limiter>,
    ) -> ServiceBuilder<Stack<WindowLimitLayer<dyn Limiter>, L>> {
        self.layer(WindowLimitLayer::new(limiter))
    }

    fn window_limit_timeout(
        self,
        limiter: Arc<dyn Limiter>,
        timeout: Duration,
    ) -> ServiceBuilder<Stack<WindowLimitLayer<dyn Limiter>, L>> {
        self.layer(WindowLimitLayer::new(limiter).with_timeout(timeout))
    }
}
