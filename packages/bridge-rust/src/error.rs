//! Error types for broker transport and RPC calls.

use courier_core::{CorrelationId, EnvelopeError};

/// Transport-level failures reported by a [`Broker`](crate::broker::Broker).
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    #[error("publish to `{queue}` was rejected by the broker")]
    Nacked { queue: String },
    #[error("queue not found: {0}")]
    QueueNotFound(String),
    #[error("unknown delivery tag: {0}")]
    UnknownDeliveryTag(u64),
    #[error("channel closed")]
    ChannelClosed,
}

/// Caller-visible failures of an RPC call.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid reply: {0}")]
    Parse(#[from] EnvelopeError),
    #[error("RPC timeout after {timeout_ms}ms on queue {queue}")]
    Timeout { queue: String, timeout_ms: u64 },
    /// The remote handler replied with `ok: false`.
    #[error("{0}")]
    Remote(String),
    #[error("correlation id already in flight: {0}")]
    DuplicateCorrelation(CorrelationId),
    #[error("pending call was dropped before completion")]
    Cancelled,
}

impl RpcError {
    /// Short label used for metrics and log fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Broker(_) => "broker",
            Self::Encode(_) => "encode",
            Self::Parse(_) => "parse",
            Self::Timeout { .. } => "timeout",
            Self::Remote(_) => "remote",
            Self::DuplicateCorrelation(_) => "duplicate",
            Self::Cancelled => "cancelled",
        }
    }
}
