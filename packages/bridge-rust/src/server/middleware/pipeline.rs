//! Pipeline composition: combines all middleware layers into a single service stack.

use tower::ServiceBuilder;

use super::metrics::{MetricsLayer, MetricsService};
use super::timeout::{TimeoutLayer, TimeoutService};
use crate::config::ServerConfig;
use crate::server::router::ActionRouter;

/// The dispatch service used by [`RpcServer`](crate::server::RpcServer).
pub type DispatchPipeline = TimeoutService<MetricsService<ActionRouter>>;

/// Build the dispatch pipeline by wrapping the `ActionRouter` with middleware layers.
///
/// Layer order (outermost to innermost):
/// 1. `TimeoutLayer` -- enforce the optional handler time limit
/// 2. `MetricsLayer` -- record timing and outcome (closest to the actual handler)
///
/// A timed-out dispatch is therefore not seen by `MetricsLayer`; it is counted
/// by the server's failed-reply statistics instead.
#[must_use]
pub fn build_dispatch_pipeline(router: ActionRouter, config: &ServerConfig) -> DispatchPipeline {
    ServiceBuilder::new()
        .layer(TimeoutLayer::new(config.handler_timeout))
        .layer(MetricsLayer)
        .service(router)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
