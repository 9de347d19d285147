//! Metrics middleware for action dispatch.
//!
//! Wraps each dispatch in a `tracing` span and records
//! `courier_dispatch_total{action,outcome}` and
//! `courier_dispatch_duration_seconds{action}` through the `metrics` facade.
//! Unregistered actions share the [`UNKNOWN_ACTION_LABEL`] label value.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use serde_json::Value;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::server::dispatch::{ActionRequest, DispatchError};
use crate::telemetry::{DISPATCH_DURATION_SECONDS, DISPATCH_TOTAL};

/// `action` label recorded for requests no handler was registered for.
pub const UNKNOWN_ACTION_LABEL: &str = "unknown";

fn action_label(action: String, result: &Result<Value, DispatchError>) -> String {
    match result {
        Err(DispatchError::UnknownAction { .. }) => UNKNOWN_ACTION_LABEL.to_string(),
        _ => action,
    }
}

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments dispatches with timing and outcome.
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

/// Service wrapper that records dispatch duration and outcome.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<ActionRequest> for MetricsService<S>
where
    S: Service<ActionRequest, Response = Value, Error = DispatchError> + Send,
    S::Future: Send + 'static,
{
    type Response = Value;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<Value, DispatchError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: ActionRequest) -> Self::Future {
        let action = req.ctx.action.clone();
        let correlation_id = req
            .ctx
            .correlation_id
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();

        let span = info_span!(
            "dispatch",
            action = %action,
            queue = %req.ctx.queue,
            correlation_id = %correlation_id,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(req);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                let outcome = match &result {
                    Ok(_) => "ok",
                    Err(err) => err.outcome(),
                };

                let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);
                tracing::debug!(action = %action, duration_ms, outcome, "dispatch complete");

                let label = action_label(action, &result);
                metrics::counter!(
                    DISPATCH_TOTAL,
                    "action" => label.clone(),
                    "outcome" => outcome
                )
                .increment(1);
                metrics::histogram!(DISPATCH_DURATION_SECONDS, "action" => label)
                    .record(elapsed.as_secs_f64());

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
