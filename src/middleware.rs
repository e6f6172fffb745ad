//! Tower middleware enforcing the limiter in front of a wrapped service.
//!
//! Framework-neutral: the layer is generic over the request type and takes an
//! extractor closure that pulls the client address and endpoint path out of
//! the request. An HTTP stack would extract the peer address (or a
//! forwarded-for header it trusts) and `uri().path()`; refusals surface as
//! [`GateError::RateLimited`] carrying the `Retry-After` value.

use crate::error::GateError;
use crate::limiter::{Decision, RateLimiter};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// A layer that gates requests through a shared [`RateLimiter`].
#[derive(Debug)]
pub struct RateLimitLayer<F> {
    limiter: Arc<RateLimiter>,
    extract: Arc<F>,
}

impl<F> RateLimitLayer<F> {
    /// Create a layer around `limiter` with `extract` pulling
    /// `(client_addr, path)` out of each request.
    pub fn new(limiter: Arc<RateLimiter>, extract: F) -> Self {
        Self { limiter, extract: Arc::new(extract) }
    }
}

impl<F> Clone for RateLimitLayer<F> {
    fn clone(&self) -> Self {
        Self { limiter: Arc::clone(&self.limiter), extract: Arc::clone(&self.extract) }
    }
}

impl<S, F> Layer<S> for RateLimitLayer<F> {
    type Service = RateLimitService<S, F>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService {
            inner: service,
            limiter: Arc::clone(&self.limiter),
            extract: Arc::clone(&self.extract),
        }
    }
}

/// Middleware service produced by [`RateLimitLayer`].
#[derive(Debug)]
pub struct RateLimitService<S, F> {
    inner: S,
    limiter: Arc<RateLimiter>,
    extract: Arc<F>,
}

impl<S: Clone, F> Clone for RateLimitService<S, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: Arc::clone(&self.limiter),
            extract: Arc::clone(&self.extract),
        }
    }
}

impl<S, F, Req> Service<Req> for RateLimitService<S, F>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    F: Fn(&Req) -> (String, String) + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = GateError<S::Error>;
    // BoxFuture keeps the service simple to compose; the hot path is the
    // synchronous check, not the allocation.
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GateError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let (client, path) = (self.extract)(&req);
        let decision = self.limiter.check(&client, &path);

        // Admission is decided before the future is polled, so a dropped
        // future still consumed its token.
        match decision {
            Decision::Allowed { .. } => {
                let mut inner = self.inner.clone();
                Box::pin(async move { inner.call(req).await.map_err(GateError::Inner) })
            }
            Decision::Denied { wait, reason } => {
                Box::pin(async move { Err(GateError::RateLimited { wait, reason }) })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DetectorConfig, RateLimitConfig};
    use std::convert::Infallible;
    use tower::{service_fn, ServiceBuilder, ServiceExt};

    #[derive(Debug, Clone)]
    struct FakeRequest {
        addr: &'static str,
        path: &'static str,
    }

    fn limiter() -> Arc<RateLimiter> {
        let rate = RateLimitConfig {
            per_client_rate_per_second: 1.0,
            burst_capacity: 3.0,
            ..RateLimitConfig::default()
        };
        Arc::new(RateLimiter::new(rate, DetectorConfig::default()).unwrap())
    }

    #[tokio::test]
    async fn allows_until_bucket_empty_then_surfaces_retry_after() {
        let layer = RateLimitLayer::new(limiter(), |req: &FakeRequest| {
            (req.addr.to_string(), req.path.to_string())
        });
        let mut svc = ServiceBuilder::new()
            .layer(layer)
            .service(service_fn(|req: FakeRequest| async move {
                Ok::<_, Infallible>(req.path)
            }));

        let req = FakeRequest { addr: "10.0.0.1", path: "/api" };
        for _ in 0..3 {
            let out = svc.ready().await.unwrap().call(req.clone()).await.unwrap();
            assert_eq!(out, "/api");
        }

        let err = svc.ready().await.unwrap().call(req).await.unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(err.retry_after_secs(), Some(1));
    }

    #[tokio::test]
    async fn inner_errors_pass_through_unchanged() {
        let layer = RateLimitLayer::new(limiter(), |req: &FakeRequest| {
            (req.addr.to_string(), req.path.to_string())
        });
        let mut svc = ServiceBuilder::new().layer(layer).service(service_fn(
            |_req: FakeRequest| async move {
                Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "upstream down"))
            },
        ));

        let err = svc
            .ready()
            .await
            .unwrap()
            .call(FakeRequest { addr: "10.0.0.2", path: "/api" })
            .await
            .unwrap_err();
        assert!(err.is_inner());
        assert_eq!(err.into_inner().unwrap().to_string(), "upstream down");
    }

    #[tokio::test]
    async fn clients_do_not_share_buckets() {
        let layer = RateLimitLayer::new(limiter(), |req: &FakeRequest| {
            (req.addr.to_string(), req.path.to_string())
        });
        let mut svc = ServiceBuilder::new()
            .layer(layer)
            .service(service_fn(|_req: FakeRequest| async move { Ok::<_, Infallible>(()) }));

        for _ in 0..3 {
            svc.ready()
                .await
                .unwrap()
                .call(FakeRequest { addr: "a", path: "/" })
                .await
                .unwrap();
        }
        assert!(svc
            .ready()
            .await
            .unwrap()
            .call(FakeRequest { addr: "a", path: "/" })
            .await
            .is_err());
        assert!(svc
            .ready()
            .await
            .unwrap()
            .call(FakeRequest { addr: "b", path: "/" })
            .await
            .is_ok());
    }
}
