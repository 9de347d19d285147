//! Tower middleware layers for the dispatch pipeline.
//!
//! - [`timeout`]: Optional per-handler time limit
//! - [`metrics`]: Dispatch timing and counting via `tracing` spans and `metrics`
//! - [`pipeline`]: Composes all layers into a single service stack

pub mod metrics;
pub mod pipeline;
pub mod timeout;

pub use self::metrics::MetricsLayer;
pub use pipeline::{build_dispatch_pipeline, DispatchPipeline};
pub use timeout::TimeoutLayer;
