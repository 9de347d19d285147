//! Timeout middleware for action dispatch.
//!
//! Rejects handlers that run longer than the configured limit with
//! `DispatchError::Timeout`. Without a limit the layer is a pass-through.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tower::{Layer, Service};

use crate::server::dispatch::{ActionRequest, DispatchError};

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Tower layer that bounds each handler invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutLayer {
    limit: Option<Duration>,
}

impl TimeoutLayer {
    #[must_use]
    pub fn new(limit: Option<Duration>) -> Self {
        Self { limit }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            limit: self.limit,
        }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

/// Service wrapper that enforces the handler time limit.
#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
    limit: Option<Duration>,
}

impl<S> Service<ActionRequest> for TimeoutService<S>
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
        let Some(limit) = self.limit else {
            return Box::pin(self.inner.call(req));
        };
        let action = req.ctx.action.clone();
        let fut = self.inner.call(req);
        Box::pin(async move {
            match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_elapsed) => Err(DispatchError::Timeout {
                    action,
                    timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                }),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
