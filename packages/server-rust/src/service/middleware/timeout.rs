//! Timeout middleware for SP calls.
//!
//! The deadline comes from each request's `timeout`, so steps with their own
//! `timeout_ms` get their own bound. An elapsed call is answered with a
//! `Timeout` classification rather than an error: the router treats it like
//! any other retryable failure.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tower::{Layer, Service};

use crate::transport::{SpRequest, SpResponse};

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutLayer;

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService { inner }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
}

impl<S> Service<SpRequest> for TimeoutService<S>
where
    S: Service<SpRequest, Response = SpResponse, Error = Infallible> + Send,
    S::Future: Send + 'static,
{
    type Response = SpResponse;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<SpResponse, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: SpRequest) -> Self::Future {
        let timeout = request.timeout;
        let fut = self.inner.call(request);
        Box::pin(async move {
            match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_elapsed) => Ok(SpResponse::timeout(format!(
                    "no answer within {}ms",
                    timeout.as_millis()
                ))),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
