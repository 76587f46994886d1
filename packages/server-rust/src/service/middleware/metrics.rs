//! Metrics middleware for SP calls.
//!
//! Wraps each call in an `sp_call` span and emits
//! `portalfed_sp_calls_total{instance,outcome}` and
//! `portalfed_sp_call_duration_ms{instance}` through the `metrics` facade.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::transport::{ResponseClass, SpRequest, SpResponse};

fn outcome_label(class: ResponseClass) -> &'static str {
    match class {
        ResponseClass::Success => "success",
        ResponseClass::ClientError => "client_error",
        ResponseClass::ServerError => "server_error",
        ResponseClass::Timeout => "timeout",
    }
}

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<SpRequest> for MetricsService<S>
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
        let instance = request.instance_id.clone();
        let span = info_span!(
            "sp_call",
            instance = %instance,
            method = request.method.as_str(),
            url = %request.url,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(request);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = start.elapsed().as_millis() as u64;
                let outcome = match &result {
                    Ok(response) => outcome_label(response.class),
                    Err(never) => match *never {},
                };

                let span = tracing::Span::current();
                span.record("duration_ms", duration_ms);
                span.record("outcome", outcome);

                metrics::counter!(
                    "portalfed_sp_calls_total",
                    "instance" => instance.clone(),
                    "outcome" => outcome
                )
                .increment(1);
                #[allow(clippy::cast_precision_loss)]
                let duration_f64 = duration_ms as f64;
                metrics::histogram!("portalfed_sp_call_duration_ms", "instance" => instance)
                    .record(duration_f64);

                tracing::debug!(duration_ms, outcome, "sp call complete");
                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
