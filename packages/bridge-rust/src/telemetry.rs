//! Tracing subscriber and Prometheus exporter setup for binaries.

use std::net::SocketAddr;

use anyhow::Context as _;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

// Metric names recorded by the bridge.

/// Dispatches handled by a server (counter, labels: action, outcome).
pub const DISPATCH_TOTAL: &str = "courier_dispatch_total";
/// Handler run time (histogram, labels: action).
pub const DISPATCH_DURATION_SECONDS: &str = "courier_dispatch_duration_seconds";
/// Completed publisher calls (counter, labels: queue, outcome).
pub const RPC_CALLS_TOTAL: &str = "courier_rpc_calls_total";
/// Failed broker connection attempts (counter).
pub const BROKER_CONNECT_FAILURES_TOTAL: &str = "courier_broker_connect_failures_total";

/// Installs the global `tracing` subscriber.
///
/// The filter comes from `RUST_LOG` and defaults to `info`. With `json` set,
/// events are written as one JSON object per line.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
    }
    .context("failed to install tracing subscriber")
}

/// Installs the Prometheus recorder and serves `/metrics` on `addr`.
///
/// Must be called from within a Tokio runtime.
///
/// # Errors
///
/// Returns an error if a recorder is already installed or the listener
/// cannot be bound.
pub fn install_metrics_exporter(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install prometheus exporter")?;
    info!(%addr, "prometheus exporter listening");
    Ok(())
}
