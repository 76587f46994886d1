//! Pipeline composition: the middleware stack around an `SpTransport`.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower::{Service, ServiceBuilder, ServiceExt};

use super::metrics::MetricsLayer;
use super::timeout::TimeoutLayer;
use crate::traits::SpTransport;
use crate::transport::{SpRequest, SpResponse};

/// Adapts an `SpTransport` to `tower::Service`.
#[derive(Clone)]
pub struct TransportService {
    transport: Arc<dyn SpTransport>,
}

impl TransportService {
    #[must_use]
    pub fn new(transport: Arc<dyn SpTransport>) -> Self {
        Self { transport }
    }
}

impl Service<SpRequest> for TransportService {
    type Response = SpResponse;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<SpResponse, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: SpRequest) -> Self::Future {
        let transport = Arc::clone(&self.transport);
        Box::pin(async move { Ok(transport.send(request).await) })
    }
}

/// Sends one request through the call pipeline.
///
/// Layer order (outermost to innermost):
/// 1. `MetricsLayer` -- span, counters, latency (includes timed-out calls)
/// 2. `TimeoutLayer` -- per-request deadline
pub async fn call_sp(transport: &Arc<dyn SpTransport>, request: SpRequest) -> SpResponse {
    let service = ServiceBuilder::new()
        .layer(MetricsLayer)
        .layer(TimeoutLayer)
        .service(TransportService::new(Arc::clone(transport)));
    match service.oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
